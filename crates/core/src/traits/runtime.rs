use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// 容器运行时抽象
///
/// 所有不可信代码的执行都从`run_untrusted`这一个入口进出，网络、
/// 权限、挂载策略只在这一处实施；调用方没有任何途径申请提权或
/// 额外挂载。每个操作都受运行时配置的deadline约束。
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// 从构建上下文（tar归档，内含Dockerfile）构建并注册镜像
    ///
    /// 返回构建输出流的全部内容，调用方必须完整消费。
    async fn image_build(&self, name: &str, build_context: Bytes) -> Result<Bytes>;

    /// 把预构建的镜像档案注册到运行时
    async fn image_load(&self, name: &str, image: Bytes) -> Result<()>;

    /// 卸载镜像
    ///
    /// 调用方按尽力而为处理：失败记日志，不影响任务结果；镜像残留
    /// 是资源泄漏而非正确性问题，但每次都必须尝试。
    async fn image_unload(&self, name: &str) -> Result<()>;

    /// 在隔离容器中运行不可信镜像（安全关键原语）
    ///
    /// 契约：网络完全禁用；非root身份执行；只挂载调用方传入的
    /// bind（宿主路径→容器路径），无任何隐式挂载；`args`作为命令，
    /// 镜像默认entrypoint保留。阻塞到容器退出或deadline；非零退出
    /// 码以`ContainerExit`上报，与启动失败区分。`auto_remove`为
    /// false时，正常退出的容器保留在原处供后续快照；非零退出的
    /// 容器一律清理。
    async fn run_untrusted(
        &self,
        image: &str,
        args: &[String],
        mounts: &HashMap<String, String>,
        auto_remove: bool,
    ) -> Result<String>;

    /// 导出容器文件系统并导入为新镜像，返回镜像档案字节流
    ///
    /// 支撑"训练完成→把得到的模型持久化为新镜像"的语义。
    async fn snapshot_container(&self, container_id: &str, image_name: &str) -> Result<Bytes>;

    /// 删除一个未自动清理的容器
    async fn remove_container(&self, container_id: &str) -> Result<()>;
}
