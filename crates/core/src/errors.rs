use thiserror::Error;

/// 计算Worker错误类型定义
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("无效的任务描述: {0}")]
    InvalidUplet(String),

    #[error("消息队列错误: {0}")]
    Broker(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("存储服务错误: {0}")]
    Storage(String),

    #[error("编排服务错误: {0}")]
    Orchestrator(String),

    #[error("容器运行时错误: {0}")]
    Runtime(String),

    #[error("容器非零退出: 镜像={image}, 退出码={code}")]
    ContainerExit { image: String, code: i64 },

    #[error("工作目录错误: {0}")]
    Workspace(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("配置错误: {0}")]
    Configuration(String),
}

/// 错误的重试分类
///
/// 取代按错误类型做运行时断言的做法：broker层对失败消息的处理
/// （重投还是丢弃）只依赖这一个枚举的匹配结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 重投不可能成功，消息确认后丢弃
    Fatal,
    /// 基础设施瞬时故障，消息交回broker按重试策略重投
    Retryable,
}

impl ComputeError {
    /// 返回该错误的重试分类
    ///
    /// 非零退出码归为Fatal：提交的算法本身有缺陷时，换一个worker
    /// 重跑只会得到同样的结果。
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ComputeError::InvalidUplet(_)
            | ComputeError::Serialization(_)
            | ComputeError::ContainerExit { .. }
            | ComputeError::Configuration(_) => FailureKind::Fatal,
            ComputeError::Broker(_)
            | ComputeError::Storage(_)
            | ComputeError::Orchestrator(_)
            | ComputeError::Runtime(_)
            | ComputeError::Workspace(_)
            | ComputeError::Timeout(_) => FailureKind::Retryable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.failure_kind(), FailureKind::Fatal)
    }

    /// 给错误补上步骤/标识符上下文，变体（以及重试分类）保持不变
    pub fn with_context(self, context: &str) -> ComputeError {
        match self {
            ComputeError::InvalidUplet(m) => ComputeError::InvalidUplet(format!("{context}: {m}")),
            ComputeError::Broker(m) => ComputeError::Broker(format!("{context}: {m}")),
            ComputeError::Serialization(m) => {
                ComputeError::Serialization(format!("{context}: {m}"))
            }
            ComputeError::Storage(m) => ComputeError::Storage(format!("{context}: {m}")),
            ComputeError::Orchestrator(m) => {
                ComputeError::Orchestrator(format!("{context}: {m}"))
            }
            ComputeError::Runtime(m) => ComputeError::Runtime(format!("{context}: {m}")),
            ComputeError::Workspace(m) => ComputeError::Workspace(format!("{context}: {m}")),
            ComputeError::Timeout(m) => ComputeError::Timeout(format!("{context}: {m}")),
            ComputeError::Configuration(m) => {
                ComputeError::Configuration(format!("{context}: {m}"))
            }
            // 已经携带镜像与退出码，上下文不再叠加
            ComputeError::ContainerExit { .. } => self,
        }
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, ComputeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let fatal = [
            ComputeError::InvalidUplet("uuid字段未设置".to_string()),
            ComputeError::Serialization("bad json".to_string()),
            ComputeError::ContainerExit {
                image: "model-abc".to_string(),
                code: 1,
            },
            ComputeError::Configuration("missing url".to_string()),
        ];
        for err in fatal {
            assert_eq!(err.failure_kind(), FailureKind::Fatal, "{err}");
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_with_context_preserves_failure_kind() {
        let err = ComputeError::Storage("503".to_string()).with_context("拉取数据集 d1");
        assert_eq!(err.failure_kind(), FailureKind::Retryable);
        assert!(err.to_string().contains("拉取数据集 d1"));

        let exit = ComputeError::ContainerExit {
            image: "model-abc".to_string(),
            code: 137,
        }
        .with_context("训练");
        assert_eq!(exit.failure_kind(), FailureKind::Fatal);
        assert!(exit.to_string().contains("model-abc"));
    }

    #[test]
    fn test_retryable_classification() {
        let retryable = [
            ComputeError::Broker("connection reset".to_string()),
            ComputeError::Storage("503".to_string()),
            ComputeError::Orchestrator("503".to_string()),
            ComputeError::Runtime("daemon unreachable".to_string()),
            ComputeError::Workspace("no space left".to_string()),
            ComputeError::Timeout("train".to_string()),
        ];
        for err in retryable {
            assert_eq!(err.failure_kind(), FailureKind::Retryable, "{err}");
            assert!(!err.is_fatal());
        }
    }
}
