//! 编排错误类型
//!
//! 库内统一返回 OrchestratorError；单个任务的失败不是错误，而是 `Observation::Failed`（见 workflow::types），
//! 由依赖方短路传播、再交给 Planner 作为重规划上下文。

use thiserror::Error;

use crate::llm::CompletionError;
use crate::store::StoreError;
use crate::workflow::PlanError;

/// 编排过程中会中断整轮处理的错误（补全服务、存储、非法计划、取消等）
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Completion failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid plan: {0}")]
    Plan(#[from] PlanError),

    /// 计划或调用栈引用了未注册的 Agent
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Session cancelled")]
    Cancelled,

    /// 会话 worker 已退出（通道关闭）
    #[error("Session worker stopped: {0}")]
    SessionClosed(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl OrchestratorError {
    /// 是否为结构化输出校验失败（对外单独上报为 validation_error，且不自动重试）
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Completion(CompletionError::SchemaValidation(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        let err: OrchestratorError = CompletionError::SchemaValidation("missing tasks".into()).into();
        assert!(err.is_validation());
        assert!(!OrchestratorError::Cancelled.is_validation());
        let err: OrchestratorError = CompletionError::Request("503".into()).into();
        assert!(!err.is_validation());
    }
}
