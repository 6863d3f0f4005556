use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ComputeError, Result};

/// 任务生命周期状态
///
/// 状态只沿 `todo → pending → done/failed` 单向推进，worker一旦
/// 认领任务就不会把状态退回去。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    #[serde(rename = "todo")]
    Todo,
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "failed")]
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Pending => "pending",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

/// uplet种类，取值即orchestrator接口里的路径段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UpletKind {
    #[serde(rename = "learnuplet")]
    Learn,
    #[serde(rename = "preduplet")]
    Pred,
}

impl UpletKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpletKind::Learn => "learnuplet",
            UpletKind::Pred => "preduplet",
        }
    }
}

/// 训练任务描述
///
/// 由API层构造、经消息队列投递到worker。worker只反序列化并校验，
/// 不负责持久化——持久性在broker和orchestrator一侧。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnUplet {
    #[serde(rename = "uuid")]
    pub id: Uuid,
    pub problem: Uuid,
    pub train_data: Vec<Uuid>,
    pub test_data: Vec<Uuid>,
    pub algo: Uuid,
    pub model_start: Uuid,
    pub model_end: Uuid,
    #[serde(default)]
    pub rank: i64,
    #[serde(rename = "worker", default = "Uuid::nil")]
    pub worker_id: Uuid,
    pub status: TaskStatus,
    #[serde(default)]
    pub perf: f64,
    #[serde(default)]
    pub train_perf: f64,
    #[serde(default)]
    pub test_perf: f64,
    #[serde(rename = "timestamp_request", default)]
    pub request_date: Option<DateTime<Utc>>,
    #[serde(rename = "timestamp_done", default)]
    pub completion_date: Option<DateTime<Utc>>,
}

impl LearnUplet {
    /// 校验任务描述的完整性
    ///
    /// 失败即Fatal：缺字段的消息重投多少次都不会变完整。任何副作用
    /// 之前必须先通过这里。
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(ComputeError::InvalidUplet("uuid字段未设置".to_string()));
        }
        if self.problem.is_nil() {
            return Err(ComputeError::InvalidUplet("problem字段未设置".to_string()));
        }
        if self.algo.is_nil() {
            return Err(ComputeError::InvalidUplet("algo字段未设置".to_string()));
        }
        if self.model_start.is_nil() {
            return Err(ComputeError::InvalidUplet(
                "model_start字段未设置".to_string(),
            ));
        }
        if self.model_end.is_nil() {
            return Err(ComputeError::InvalidUplet(
                "model_end字段未设置".to_string(),
            ));
        }
        check_dataset_list(&self.train_data, "train_data")?;
        check_dataset_list(&self.test_data, "test_data")?;
        Ok(())
    }

    /// 从消息载荷反序列化并校验
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let uplet: LearnUplet = serde_json::from_slice(payload)
            .map_err(|e| ComputeError::Serialization(format!("解析learnuplet失败: {e}")))?;
        uplet.validate()?;
        Ok(uplet)
    }
}

/// 预测任务描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredUplet {
    #[serde(rename = "uuid")]
    pub id: Uuid,
    pub problem: Uuid,
    pub model: Uuid,
    pub data: Vec<Uuid>,
    #[serde(rename = "worker", default = "Uuid::nil")]
    pub worker_id: Uuid,
    pub status: TaskStatus,
    #[serde(rename = "timestamp_request", default)]
    pub request_date: Option<DateTime<Utc>>,
    #[serde(rename = "timestamp_done", default)]
    pub completion_date: Option<DateTime<Utc>>,
}

impl PredUplet {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(ComputeError::InvalidUplet("uuid字段未设置".to_string()));
        }
        if self.problem.is_nil() {
            return Err(ComputeError::InvalidUplet("problem字段未设置".to_string()));
        }
        if self.model.is_nil() {
            return Err(ComputeError::InvalidUplet("model字段未设置".to_string()));
        }
        check_dataset_list(&self.data, "data")?;
        Ok(())
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let uplet: PredUplet = serde_json::from_slice(payload)
            .map_err(|e| ComputeError::Serialization(format!("解析preduplet失败: {e}")))?;
        uplet.validate()?;
        Ok(uplet)
    }
}

fn check_dataset_list(list: &[Uuid], field: &str) -> Result<()> {
    if list.is_empty() {
        return Err(ComputeError::InvalidUplet(format!("{field}字段为空")));
    }
    for (n, id) in list.iter().enumerate() {
        if id.is_nil() {
            return Err(ComputeError::InvalidUplet(format!(
                "{field}字段第{n}项为nil UUID"
            )));
        }
    }
    Ok(())
}
