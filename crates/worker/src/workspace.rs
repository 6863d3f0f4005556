use std::path::{Path, PathBuf};

use compute_core::{ComputeError, Result, WorkerConfig};
use tracing::warn;

/// 任务级工作目录
///
/// 目录树按任务标识命名空间化（learn按起始模型ID、pred按uplet
/// ID），并发任务在同一台宿主机上互不碰撞。任务结束后无条件整树
/// 删除，磁盘不随任务数量增长。
#[derive(Debug)]
pub struct TaskWorkspace {
    root: PathBuf,
    dirs: Vec<PathBuf>,
    train: PathBuf,
    test: PathBuf,
    untargeted_test: PathBuf,
    model: PathBuf,
}

impl TaskWorkspace {
    /// 训练任务的目录布局：train/test/untargeted_test/model四个子目录
    pub fn learn(data_root: &Path, config: &WorkerConfig, key: &str) -> Self {
        let root = data_root.join(key);
        let train = root.join(&config.train_folder);
        let test = root.join(&config.test_folder);
        let untargeted_test = root.join(&config.untargeted_test_folder);
        let model = root.join(&config.model_folder);
        Self {
            dirs: vec![
                train.clone(),
                test.clone(),
                untargeted_test.clone(),
                model.clone(),
            ],
            root,
            train,
            test,
            untargeted_test,
            model,
        }
    }

    /// 预测任务的目录布局：只需要test子目录
    pub fn pred(data_root: &Path, config: &WorkerConfig, key: &str) -> Self {
        let root = data_root.join(format!("pred-{key}"));
        let train = root.join(&config.train_folder);
        let test = root.join(&config.test_folder);
        let untargeted_test = root.join(&config.untargeted_test_folder);
        let model = root.join(&config.model_folder);
        Self {
            dirs: vec![test.clone()],
            root,
            train,
            test,
            untargeted_test,
            model,
        }
    }

    /// 创建目录树；失败视为宿主机磁盘/权限问题，任务在任何容器
    /// 运行之前就中止
    pub async fn stage(&self) -> Result<()> {
        for dir in &self.dirs {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                ComputeError::Workspace(format!("创建目录 {} 失败: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// 把模型在去标测试集上的预测挪回带标的test目录，供perf步骤
    /// 对照真值打分
    pub async fn restore_predictions(&self, pred_folder: &str) -> Result<()> {
        let from = self.untargeted_test.join(pred_folder);
        let to = self.test.join(pred_folder);
        tokio::fs::rename(&from, &to).await.map_err(|e| {
            ComputeError::Workspace(format!(
                "移动预测结果 {} -> {} 失败: {e}",
                from.display(),
                to.display()
            ))
        })
    }

    /// 无条件删除整个工作目录
    ///
    /// 清理失败只记日志：已经上报的任务结果不因清理问题被翻盘。
    pub async fn remove(&self) {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除工作目录 {} 失败: {}", self.root.display(), e),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn train_dir(&self) -> &Path {
        &self.train
    }

    pub fn test_dir(&self) -> &Path {
        &self.test
    }

    pub fn untargeted_test_dir(&self) -> &Path {
        &self.untargeted_test
    }

    pub fn model_dir(&self) -> &Path {
        &self.model
    }
}
