//! 工具箱：Tool trait、注册表、执行器（超时 + 审计日志）与内置工具（join / 补全驱动工具）

pub mod completion;
pub mod executor;
pub mod join;
pub mod registry;

pub use completion::{CompletionJoinTool, CompletionTool};
pub use executor::ToolExecutor;
pub use join::JoinTool;
pub use registry::{Tool, ToolContext, ToolRegistry, DEPENDENCY_RESULTS_HEADER};
