use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::Result;

/// 消息处理器
///
/// 返回错误时由broker按`FailureKind`决定重投还是丢弃。实现必须在
/// 注册时给定的超时窗口内返回，否则消息视为丢失、可被其他worker
/// 重新领取（at-least-once投递）。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<()>;
}

/// 消息代理抽象接口
#[async_trait]
pub trait Broker: Send + Sync {
    /// 发布消息到指定主题；只在连接/序列化出错时失败，绝不静默丢弃
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// 为主题注册处理器
    ///
    /// 同一主题最多`concurrency`个处理器调用并发执行；单次调用超过
    /// `timeout`即视为失败并进入重投流程。
    async fn register_handler(
        &self,
        topic: &str,
        handler: Arc<dyn TaskHandler>,
        concurrency: usize,
        timeout: Duration,
    ) -> Result<()>;

    /// 阻塞分发消息，直到收到关闭信号
    ///
    /// 收到信号后停止领取新消息，在途的处理器调用自然跑完或超时。
    async fn consume_until_shutdown(&self, shutdown: broadcast::Receiver<()>) -> Result<()>;
}
