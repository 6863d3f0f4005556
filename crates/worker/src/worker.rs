use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use compute_core::{
    BlobStream, ComputeError, ContainerRuntime, LearnUplet, Orchestrator, Perfuplet, PredUplet,
    Result, Storage, TaskStatus, UpletKind, WorkerConfig,
};
use flate2::read::GzDecoder;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::workspace::TaskWorkspace;

/// perf步骤写出的结果文件名（容器命令约定的一部分）
const PERFORMANCE_FILE: &str = "performance.json";

/// 工作流编排器
///
/// 每个任务是一条阻塞的顺序流水线，任务内没有并发；任务之间的
/// 并发由broker层的并发度控制。runtime/storage/orchestrator都是
/// 注入的窄接口，测试换成内存实现。
pub struct Worker {
    config: WorkerConfig,
    data_root: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    storage: Arc<dyn Storage>,
    orchestrator: Arc<dyn Orchestrator>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        storage: Arc<dyn Storage>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            data_root: PathBuf::from(&config.data_root),
            config,
            runtime,
            storage,
            orchestrator,
        }
    }

    /// 处理一条训练任务消息
    ///
    /// 反序列化和校验失败是Fatal（消息重投不会变好）；校验通过后
    /// 先上报pending，流水线结束上报done/failed，错误原样返回给
    /// broker层做重投决策。
    pub async fn handle_learn(&self, payload: &[u8]) -> Result<()> {
        let uplet: LearnUplet = serde_json::from_slice(payload).map_err(|e| {
            ComputeError::Serialization(format!(
                "解析learnuplet失败: {e} -- 载荷: {}",
                String::from_utf8_lossy(payload)
            ))
        })?;

        if let Err(e) = uplet.validate() {
            error!("训练任务 {} 校验失败: {}", uplet.id, e);
            self.report_status(UpletKind::Learn, TaskStatus::Failed, uplet.id)
                .await;
            return Err(e);
        }

        info!(
            "收到训练任务: id={}, problem={}, model_start={}, 训练集{}个, 测试集{}个",
            uplet.id,
            uplet.problem,
            uplet.model_start,
            uplet.train_data.len(),
            uplet.test_data.len()
        );
        self.report_status(UpletKind::Learn, TaskStatus::Pending, uplet.id)
            .await;

        match self.learn_workflow(&uplet).await {
            Ok(()) => {
                info!("训练任务 {} 完成", uplet.id);
                self.report_status(UpletKind::Learn, TaskStatus::Done, uplet.id)
                    .await;
                Ok(())
            }
            Err(e) => {
                error!("训练任务 {} 失败: {}", uplet.id, e);
                self.report_status(UpletKind::Learn, TaskStatus::Failed, uplet.id)
                    .await;
                Err(e)
            }
        }
    }

    /// 处理一条预测任务消息
    pub async fn handle_pred(&self, payload: &[u8]) -> Result<()> {
        let uplet: PredUplet = serde_json::from_slice(payload).map_err(|e| {
            ComputeError::Serialization(format!(
                "解析preduplet失败: {e} -- 载荷: {}",
                String::from_utf8_lossy(payload)
            ))
        })?;

        if let Err(e) = uplet.validate() {
            error!("预测任务 {} 校验失败: {}", uplet.id, e);
            self.report_status(UpletKind::Pred, TaskStatus::Failed, uplet.id)
                .await;
            return Err(e);
        }

        info!(
            "收到预测任务: id={}, model={}, 数据集{}个",
            uplet.id,
            uplet.model,
            uplet.data.len()
        );
        self.report_status(UpletKind::Pred, TaskStatus::Pending, uplet.id)
            .await;

        match self.pred_workflow(&uplet).await {
            Ok(()) => {
                info!("预测任务 {} 完成", uplet.id);
                self.report_status(UpletKind::Pred, TaskStatus::Done, uplet.id)
                    .await;
                Ok(())
            }
            Err(e) => {
                error!("预测任务 {} 失败: {}", uplet.id, e);
                self.report_status(UpletKind::Pred, TaskStatus::Failed, uplet.id)
                    .await;
                Err(e)
            }
        }
    }

    /// 训练工作流：流水线 + 无条件清理
    async fn learn_workflow(&self, uplet: &LearnUplet) -> Result<()> {
        let problem_image = self.problem_image_name(uplet.problem);
        let model_image = self.model_image_name(uplet.model_start);
        let workspace =
            TaskWorkspace::learn(&self.data_root, &self.config, &uplet.model_start.to_string());

        let result = self
            .learn_pipeline(uplet, &problem_image, &model_image, &workspace)
            .await;

        // 不管流水线死在哪一步，镜像和工作目录都要清
        self.unload_image_best_effort(&problem_image).await;
        self.unload_image_best_effort(&model_image).await;
        workspace.remove().await;

        result
    }

    async fn learn_pipeline(
        &self,
        uplet: &LearnUplet,
        problem_image: &str,
        model_image: &str,
        workspace: &TaskWorkspace,
    ) -> Result<()> {
        // 1. 拉取并构建problem工作流镜像
        let blob = self
            .storage
            .get_problem_workflow_blob(uplet.problem)
            .await
            .map_err(|e| e.with_context(&format!("拉取problem工作流 {}", uplet.problem)))?;
        self.build_image_from_blob(problem_image, blob).await?;

        // 2. 拉取并构建起始模型镜像
        let blob = self
            .storage
            .get_algo_blob(uplet.model_start)
            .await
            .map_err(|e| e.with_context(&format!("拉取模型 {}", uplet.model_start)))?;
        self.build_image_from_blob(model_image, blob).await?;

        // 3. 建任务工作目录
        workspace.stage().await?;

        // 4. 拉取数据集；第一个失败就中止，不留半套数据
        for data_id in &uplet.train_data {
            self.pull_dataset(*data_id, workspace.train_dir(), "训练集")
                .await?;
        }
        for data_id in &uplet.test_data {
            self.pull_dataset(*data_id, workspace.test_dir(), "测试集")
                .await?;
        }

        // 5. 去标：problem镜像把测试集的真值标签剥掉
        self.detarget(problem_image, workspace).await.map_err(|e| {
            e.with_context(&format!(
                "为problem {} 去标测试集 (model_start: {})",
                uplet.problem, uplet.model_start
            ))
        })?;

        // 6. 训练；容器不自动删除，留给下一步快照
        let train_container = self
            .train(model_image, workspace)
            .await
            .map_err(|e| e.with_context(&format!("训练任务 {}", uplet.id)))?;

        // 7. 快照训练容器为结束模型镜像并上传，容器用完即删
        let snapshot_result = self.snapshot_end_model(uplet, &train_container).await;
        if let Err(e) = self.runtime.remove_container(&train_container).await {
            warn!("删除训练容器 {} 失败: {}", train_container, e);
        }
        snapshot_result?;

        // 8. 把预测结果挪回带标test目录
        workspace
            .restore_predictions(&self.config.pred_folder)
            .await?;

        // 9. 算分
        self.compute_perf(problem_image, workspace)
            .await
            .map_err(|e| {
                e.with_context(&format!(
                    "为problem {} 和模型 {} 算分",
                    uplet.problem, uplet.model_end
                ))
            })?;

        // 10. 读结果文件并上报orchestrator
        let perf_path = workspace.test_dir().join(PERFORMANCE_FILE);
        let perf_bytes = tokio::fs::read(&perf_path).await.map_err(|e| {
            ComputeError::Workspace(format!("读取结果文件 {} 失败: {e}", perf_path.display()))
        })?;
        let perfuplet = Perfuplet::from_slice(&perf_bytes)?;
        self.orchestrator
            .post_learn_result(uplet.id, &perfuplet)
            .await
            .map_err(|e| e.with_context(&format!("上报训练结果 {}", uplet.id)))?;

        Ok(())
    }

    /// 预测工作流
    async fn pred_workflow(&self, uplet: &PredUplet) -> Result<()> {
        let model_image = self.model_image_name(uplet.model);
        let workspace = TaskWorkspace::pred(&self.data_root, &self.config, &uplet.id.to_string());

        let result = self.pred_pipeline(uplet, &model_image, &workspace).await;

        self.unload_image_best_effort(&model_image).await;
        workspace.remove().await;

        result
    }

    async fn pred_pipeline(
        &self,
        uplet: &PredUplet,
        model_image: &str,
        workspace: &TaskWorkspace,
    ) -> Result<()> {
        // 模型blob是训练快照产出的镜像档案，直接加载
        let blob = self
            .storage
            .get_model_blob(uplet.model)
            .await
            .map_err(|e| e.with_context(&format!("拉取模型 {}", uplet.model)))?;
        self.load_image_from_blob(model_image, blob).await?;

        workspace.stage().await?;

        for data_id in &uplet.data {
            self.pull_dataset(*data_id, workspace.test_dir(), "预测数据")
                .await?;
        }

        self.predict(model_image, workspace)
            .await
            .map_err(|e| e.with_context(&format!("模型 {} 预测", uplet.model)))?;

        Ok(())
    }

    /// 去标：测试集挂成真值输入，去标目录挂成输出
    async fn detarget(&self, problem_image: &str, workspace: &TaskWorkspace) -> Result<String> {
        let args = to_args(&["-T", "detarget", "-i", "/true_data", "-s", "/pred_data"]);
        let mounts = HashMap::from([
            (
                path_string(workspace.test_dir()),
                "/true_data/test".to_string(),
            ),
            (
                path_string(workspace.untargeted_test_dir()),
                "/pred_data/test".to_string(),
            ),
        ]);
        self.runtime
            .run_untrusted(problem_image, &args, &mounts, true)
            .await
    }

    /// 训练：去标测试集以/data/test的身份暴露给模型
    async fn train(&self, model_image: &str, workspace: &TaskWorkspace) -> Result<String> {
        let args = to_args(&["-V", "/data", "-T", "train"]);
        let mounts = HashMap::from([
            (
                path_string(workspace.train_dir()),
                "/data/train".to_string(),
            ),
            (
                path_string(workspace.untargeted_test_dir()),
                "/data/test".to_string(),
            ),
            (
                path_string(workspace.model_dir()),
                "/data/model".to_string(),
            ),
        ]);
        self.runtime
            .run_untrusted(model_image, &args, &mounts, false)
            .await
    }

    /// 预测
    async fn predict(&self, model_image: &str, workspace: &TaskWorkspace) -> Result<String> {
        let args = to_args(&["-V", "/data", "-T", "predict"]);
        let mounts = HashMap::from([(
            path_string(workspace.test_dir()),
            "/true_data".to_string(),
        )]);
        self.runtime
            .run_untrusted(model_image, &args, &mounts, true)
            .await
    }

    /// 算分：与去标同一个problem镜像，换个动词和挂载角色
    async fn compute_perf(&self, problem_image: &str, workspace: &TaskWorkspace) -> Result<String> {
        let args = to_args(&["-T", "perf", "-i", "/true_data", "-s", "/pred_data"]);
        let mounts = HashMap::from([
            (
                path_string(workspace.test_dir()),
                "/true_data/test".to_string(),
            ),
            (
                path_string(workspace.train_dir()),
                "/pred_data/train".to_string(),
            ),
        ]);
        self.runtime
            .run_untrusted(problem_image, &args, &mounts, true)
            .await
    }

    /// 快照训练容器为结束模型镜像并上传storage
    async fn snapshot_end_model(&self, uplet: &LearnUplet, container_id: &str) -> Result<()> {
        let end_image = self.model_image_name(uplet.model_end);
        let result = async {
            let snapshot = self
                .runtime
                .snapshot_container(container_id, &end_image)
                .await
                .map_err(|e| {
                    e.with_context(&format!("快照容器 {container_id} 为镜像 {end_image}"))
                })?;
            self.storage
                .post_model(uplet.model_end, snapshot)
                .await
                .map_err(|e| e.with_context(&format!("上传结束模型 {}", uplet.model_end)))
        }
        .await;
        // 快照镜像本地不留，成功失败都卸
        self.unload_image_best_effort(&end_image).await;
        result
    }

    /// 下载并解压镜像blob（tar.gz构建上下文），构建为命名镜像
    async fn build_image_from_blob(&self, image_name: &str, blob: BlobStream) -> Result<()> {
        let compressed = collect_blob(blob).await?;
        let build_context = gunzip(&compressed, image_name)?;
        let output = self
            .runtime
            .image_build(image_name, Bytes::from(build_context))
            .await
            .map_err(|e| e.with_context(&format!("构建镜像 {image_name}")))?;
        // 构建输出流必须消费完，内容只进日志
        info!("镜像 {} 构建完成，输出 {} 字节", image_name, output.len());
        Ok(())
    }

    /// 下载并解压镜像档案blob，加载为命名镜像
    async fn load_image_from_blob(&self, image_name: &str, blob: BlobStream) -> Result<()> {
        let compressed = collect_blob(blob).await?;
        let archive = gunzip(&compressed, image_name)?;
        self.runtime
            .image_load(image_name, Bytes::from(archive))
            .await
            .map_err(|e| e.with_context(&format!("加载镜像 {image_name}")))
    }

    /// 把一个数据集blob流式写进目标目录，文件名即数据集ID
    async fn pull_dataset(&self, data_id: Uuid, dir: &Path, what: &str) -> Result<()> {
        let mut stream = self
            .storage
            .get_data_blob(data_id)
            .await
            .map_err(|e| e.with_context(&format!("拉取{what} {data_id}")))?;

        let path = dir.join(data_id.to_string());
        let mut file = tokio::fs::File::create(&path).await.map_err(|e| {
            ComputeError::Workspace(format!("创建文件 {} 失败: {e}", path.display()))
        })?;

        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                e.with_context(&format!("下载{what} {data_id} 中断 ({written} 字节已写入)"))
            })?;
            file.write_all(&chunk).await.map_err(|e| {
                ComputeError::Workspace(format!("写入文件 {} 失败: {e}", path.display()))
            })?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| {
            ComputeError::Workspace(format!("落盘文件 {} 失败: {e}", path.display()))
        })?;
        Ok(())
    }

    /// 镜像卸载按尽力而为处理，失败只记日志
    async fn unload_image_best_effort(&self, image_name: &str) {
        if let Err(e) = self.runtime.image_unload(image_name).await {
            warn!("卸载镜像 {} 失败: {}", image_name, e);
        }
    }

    /// 状态上报按尽力而为处理：上报是可见性手段，不是正确性前提
    async fn report_status(&self, kind: UpletKind, status: TaskStatus, id: Uuid) {
        if let Err(e) = self.orchestrator.update_uplet_status(kind, status, id).await {
            warn!(
                "上报{}状态 {} (id: {}) 失败: {}",
                kind.as_str(),
                status.as_str(),
                id,
                e
            );
        }
    }

    fn problem_image_name(&self, id: Uuid) -> String {
        format!("{}-{}", self.config.problem_image_prefix, id)
    }

    fn model_image_name(&self, id: Uuid) -> String {
        format!("{}-{}", self.config.model_image_prefix, id)
    }
}

/// 收齐一个blob流
async fn collect_blob(mut stream: BlobStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}

/// 解压tar.gz镜像blob
fn gunzip(compressed: &[u8], what: &str) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ComputeError::Storage(format!("解压镜像blob {what} 失败: {e}")))?;
    Ok(out)
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_naming_is_namespaced() {
        struct NoopRuntime;
        #[async_trait::async_trait]
        impl ContainerRuntime for NoopRuntime {
            async fn image_build(&self, _: &str, _: Bytes) -> Result<Bytes> {
                Ok(Bytes::new())
            }
            async fn image_load(&self, _: &str, _: Bytes) -> Result<()> {
                Ok(())
            }
            async fn image_unload(&self, _: &str) -> Result<()> {
                Ok(())
            }
            async fn run_untrusted(
                &self,
                _: &str,
                _: &[String],
                _: &HashMap<String, String>,
                _: bool,
            ) -> Result<String> {
                Ok(String::new())
            }
            async fn snapshot_container(&self, _: &str, _: &str) -> Result<Bytes> {
                Ok(Bytes::new())
            }
            async fn remove_container(&self, _: &str) -> Result<()> {
                Ok(())
            }
        }
        struct NoopStorage;
        #[async_trait::async_trait]
        impl Storage for NoopStorage {
            async fn get_problem_workflow_blob(&self, _: Uuid) -> Result<BlobStream> {
                Ok(Box::pin(futures::stream::empty()))
            }
            async fn get_algo_blob(&self, _: Uuid) -> Result<BlobStream> {
                Ok(Box::pin(futures::stream::empty()))
            }
            async fn get_model_blob(&self, _: Uuid) -> Result<BlobStream> {
                Ok(Box::pin(futures::stream::empty()))
            }
            async fn get_data_blob(&self, _: Uuid) -> Result<BlobStream> {
                Ok(Box::pin(futures::stream::empty()))
            }
            async fn post_model(&self, _: Uuid, _: Bytes) -> Result<()> {
                Ok(())
            }
        }
        struct NoopOrchestrator;
        #[async_trait::async_trait]
        impl Orchestrator for NoopOrchestrator {
            async fn update_uplet_status(
                &self,
                _: UpletKind,
                _: TaskStatus,
                _: Uuid,
            ) -> Result<()> {
                Ok(())
            }
            async fn post_learn_result(&self, _: Uuid, _: &Perfuplet) -> Result<()> {
                Ok(())
            }
        }

        let worker = Worker::new(
            WorkerConfig::default(),
            Arc::new(NoopRuntime),
            Arc::new(NoopStorage),
            Arc::new(NoopOrchestrator),
        );

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(worker.model_image_name(a), worker.model_image_name(b));
        assert_ne!(worker.problem_image_name(a), worker.model_image_name(a));
        assert!(worker.problem_image_name(a).starts_with("problem-"));
        assert!(worker.model_image_name(a).starts_with("model-"));
    }
}
