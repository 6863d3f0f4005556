use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use compute_core::{
    BlobStream, ComputeError, Orchestrator, OrchestratorConfig, Perfuplet, Result, Storage,
    StorageConfig, TaskStatus, UpletKind,
};
use futures::StreamExt;
use tracing::debug;
use uuid::Uuid;

/// 存储服务HTTP路由
const STORAGE_PROBLEM_WORKFLOW_ROUTE: &str = "problem";
const STORAGE_ALGO_ROUTE: &str = "algo";
const STORAGE_MODEL_ROUTE: &str = "model";
const STORAGE_DATA_ROUTE: &str = "data";
const BLOB_SUFFIX: &str = "blob";

/// 编排服务HTTP路由
const ORCHESTRATOR_STATUS_UPDATE_ROUTE: &str = "update_status";
const ORCHESTRATOR_LEARN_RESULT_ROUTE: &str = "learndone";

/// 存储服务HTTP客户端
pub struct StorageApi {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl StorageApi {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ComputeError::Storage(format!("创建HTTP客户端失败: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// 拉取一个对象的blob，返回下载流
    async fn get_object_blob(&self, prefix: &str, id: Uuid) -> Result<BlobStream> {
        let url = format!("{}/{}/{}/{}", self.base_url, prefix, id, BLOB_SUFFIX);
        debug!("GET {}", url);

        let mut request = self.client.get(&url);
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ComputeError::Storage(format!("请求 {url} 失败: {e}")))?;

        if !response.status().is_success() {
            return Err(ComputeError::Storage(format!(
                "请求 {url} 返回异常状态码: {}",
                response.status()
            )));
        }

        let url_for_stream = url.clone();
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| ComputeError::Storage(format!("下载 {url_for_stream} 中断: {e}")))
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl Storage for StorageApi {
    async fn get_problem_workflow_blob(&self, id: Uuid) -> Result<BlobStream> {
        self.get_object_blob(STORAGE_PROBLEM_WORKFLOW_ROUTE, id).await
    }

    async fn get_algo_blob(&self, id: Uuid) -> Result<BlobStream> {
        self.get_object_blob(STORAGE_ALGO_ROUTE, id).await
    }

    async fn get_model_blob(&self, id: Uuid) -> Result<BlobStream> {
        self.get_object_blob(STORAGE_MODEL_ROUTE, id).await
    }

    async fn get_data_blob(&self, id: Uuid) -> Result<BlobStream> {
        self.get_object_blob(STORAGE_DATA_ROUTE, id).await
    }

    async fn post_model(&self, id: Uuid, image: Bytes) -> Result<()> {
        let url = format!(
            "{}/{}/{}/{}",
            self.base_url, STORAGE_MODEL_ROUTE, id, BLOB_SUFFIX
        );
        debug!("POST {} ({} 字节)", url, image.len());

        let mut request = self.client.post(&url).body(image);
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ComputeError::Storage(format!("上传模型到 {url} 失败: {e}")))?;

        if !response.status().is_success() {
            return Err(ComputeError::Storage(format!(
                "上传模型到 {url} 返回异常状态码: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// 编排服务HTTP客户端
pub struct OrchestratorApi {
    client: reqwest::Client,
    base_url: String,
}

impl OrchestratorApi {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ComputeError::Orchestrator(format!("创建HTTP客户端失败: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Orchestrator for OrchestratorApi {
    async fn update_uplet_status(
        &self,
        kind: UpletKind,
        status: TaskStatus,
        id: Uuid,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/{}/{}",
            self.base_url,
            ORCHESTRATOR_STATUS_UPDATE_ROUTE,
            kind.as_str(),
            id
        );
        debug!("POST {} status={}", url, status.as_str());

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "status": status.as_str() }))
            .send()
            .await
            .map_err(|e| ComputeError::Orchestrator(format!("状态上报到 {url} 失败: {e}")))?;

        if !response.status().is_success() {
            return Err(ComputeError::Orchestrator(format!(
                "状态上报到 {url} 返回异常状态码: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn post_learn_result(&self, id: Uuid, perf: &Perfuplet) -> Result<()> {
        let url = format!("{}/{}/{}", self.base_url, ORCHESTRATOR_LEARN_RESULT_ROUTE, id);
        debug!("POST {} perf={}", url, perf.perf);

        let response = self
            .client
            .post(&url)
            .json(perf)
            .send()
            .await
            .map_err(|e| ComputeError::Orchestrator(format!("结果上报到 {url} 失败: {e}")))?;

        if !response.status().is_success() {
            return Err(ComputeError::Orchestrator(format!(
                "结果上报到 {url} 返回异常状态码: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_url_layout() {
        let api = StorageApi::new(&StorageConfig {
            url: "http://storage:80/".to_string(),
            ..Default::default()
        })
        .unwrap();
        // 结尾斜杠被归一
        assert_eq!(api.base_url, "http://storage:80");
    }

    #[test]
    fn test_orchestrator_url_layout() {
        let api = OrchestratorApi::new(&OrchestratorConfig {
            url: "http://orchestrator:80".to_string(),
            timeout_seconds: 5,
        })
        .unwrap();
        assert_eq!(api.base_url, "http://orchestrator:80");
    }
}
