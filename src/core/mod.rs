//! 核心层：错误类型、存储重试、会话监管（取消）、工具调度、优雅关闭、组件装配

pub mod builder;
pub mod error;
pub mod retry;
pub mod session_supervisor;
pub mod shutdown;
pub mod task_scheduler;

pub use builder::{build_mediator, create_completion_from_config, MediatorBuilder};
pub use error::OrchestratorError;
pub use retry::{RetryPolicy, Retryable};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use task_scheduler::TaskScheduler;
