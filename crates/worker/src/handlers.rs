use std::sync::Arc;

use async_trait::async_trait;
use compute_core::{Result, TaskHandler};

use crate::worker::Worker;

/// 训练主题的消息处理器
pub struct LearnHandler {
    worker: Arc<Worker>,
}

impl LearnHandler {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl TaskHandler for LearnHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        self.worker.handle_learn(payload).await
    }
}

/// 预测主题的消息处理器
pub struct PredHandler {
    worker: Arc<Worker>,
}

impl PredHandler {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl TaskHandler for PredHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        self.worker.handle_pred(payload).await
    }
}
