use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ComputeError, Result};

/// 训练结果产物
///
/// 由problem镜像的perf步骤写出（工作目录test子目录下的
/// performance.json），worker读出后原样转交orchestrator。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Perfuplet {
    pub status: String,
    pub perf: f64,
    #[serde(default)]
    pub train_perf: HashMap<String, f64>,
    #[serde(default)]
    pub test_perf: HashMap<String, f64>,
}

impl Perfuplet {
    /// 从perf步骤写出的JSON文件内容解析
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ComputeError::Serialization(format!("解析performance.json失败: {e}")))
    }
}
