use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use compute_core::{AppConfig, Broker, BrokerMode, ContainerRuntime, Orchestrator, Storage};
use compute_infrastructure::{DockerRuntime, InMemoryBroker, OrchestratorApi, RabbitMqBroker, StorageApi};
use compute_worker::{LearnHandler, PredHandler, Worker};
use tokio::sync::broadcast;
use tracing::info;

/// 主应用程序：装配协作方并驱动消费循环
pub struct Application {
    config: AppConfig,
    broker: Arc<dyn Broker>,
    worker: Arc<Worker>,
}

impl Application {
    /// 创建应用实例：broker、容器运行时、两个HTTP客户端、Worker
    pub async fn new(config: AppConfig) -> Result<Self> {
        let broker = create_broker(&config).await?;

        info!("连接Docker daemon");
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(
            DockerRuntime::new(&config.runtime)
                .await
                .context("连接容器运行时失败")?,
        );

        let storage: Arc<dyn Storage> =
            Arc::new(StorageApi::new(&config.storage).context("创建存储客户端失败")?);
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(
            OrchestratorApi::new(&config.orchestrator).context("创建编排客户端失败")?,
        );

        let worker = Arc::new(Worker::new(
            config.worker.clone(),
            runtime,
            storage,
            orchestrator,
        ));

        Ok(Self {
            config,
            broker,
            worker,
        })
    }

    /// 注册主题处理器并消费到收到关闭信号为止
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.broker
            .register_handler(
                &self.config.broker.learn_topic,
                Arc::new(LearnHandler::new(Arc::clone(&self.worker))),
                self.config.broker.learn_parallelism,
                Duration::from_secs(self.config.broker.learn_timeout_seconds),
            )
            .await
            .context("注册训练主题处理器失败")?;

        self.broker
            .register_handler(
                &self.config.broker.predict_topic,
                Arc::new(PredHandler::new(Arc::clone(&self.worker))),
                self.config.broker.predict_parallelism,
                Duration::from_secs(self.config.broker.predict_timeout_seconds),
            )
            .await
            .context("注册预测主题处理器失败")?;

        info!("开始消费任务");
        self.broker
            .consume_until_shutdown(shutdown_rx)
            .await
            .context("消费循环异常退出")?;

        info!("消费循环已停止");
        Ok(())
    }
}

/// 按配置选择broker后端
async fn create_broker(config: &AppConfig) -> Result<Arc<dyn Broker>> {
    match config.broker.mode {
        BrokerMode::Rabbitmq => {
            info!("连接消息队列: {}", mask_amqp_url(&config.broker.url));
            let broker = RabbitMqBroker::new(config.broker.clone())
                .await
                .context("连接消息队列失败")?;
            Ok(Arc::new(broker))
        }
        BrokerMode::Memory => {
            info!("使用内存消息队列（嵌入模式）");
            Ok(Arc::new(InMemoryBroker::new(config.broker.max_attempts)))
        }
    }
}

/// 屏蔽AMQP URL中的敏感信息
fn mask_amqp_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_amqp_url() {
        assert_eq!(
            mask_amqp_url("amqp://guest:secret@mq:5672"),
            "amqp://guest:***@mq:5672"
        );
        assert_eq!(mask_amqp_url("amqp://mq:5672"), "amqp://mq:5672");
    }
}
