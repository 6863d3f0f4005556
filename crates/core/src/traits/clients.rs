use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use uuid::Uuid;

use crate::models::{Perfuplet, TaskStatus, UpletKind};
use crate::Result;

/// blob下载流，调用方负责完整消费
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 存储服务客户端接口
#[async_trait]
pub trait Storage: Send + Sync {
    /// 拉取problem工作流镜像blob（tar.gz构建上下文）
    async fn get_problem_workflow_blob(&self, id: Uuid) -> Result<BlobStream>;

    /// 拉取算法镜像blob（tar.gz构建上下文）
    async fn get_algo_blob(&self, id: Uuid) -> Result<BlobStream>;

    /// 拉取模型镜像blob（训练快照产出的镜像档案）
    async fn get_model_blob(&self, id: Uuid) -> Result<BlobStream>;

    /// 拉取数据集blob
    async fn get_data_blob(&self, id: Uuid) -> Result<BlobStream>;

    /// 上传训练得到的模型镜像档案
    async fn post_model(&self, id: Uuid, image: Bytes) -> Result<()>;
}

/// 编排服务客户端接口
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// 上报uplet状态变更
    async fn update_uplet_status(&self, kind: UpletKind, status: TaskStatus, id: Uuid)
        -> Result<()>;

    /// 上报训练结果
    async fn post_learn_result(&self, id: Uuid, perf: &Perfuplet) -> Result<()>;
}
