//! Hive - Rust 多智能体任务编排引擎
//!
//! 模块划分：
//! - **agent**: Agent 状态机、需求轮、Planner、Executor（依赖图执行与委派挂起）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、存储重试、会话监管（取消）、工具调度、优雅关闭、组件装配
//! - **gateway**: WebSocket 网关（feature `gateway`）
//! - **llm**: 补全服务抽象与实现（OpenAI 兼容 / Mock / 脚本化）
//! - **mediator**: 会话 worker、调用栈、委派与结果回传、合并计划视图、出站事件
//! - **memory**: 对话消息与上下文窗口
//! - **store**: 对话 / 任务结果 / 调用栈仓储（内存 / SQLite）
//! - **tools**: 工具 trait、注册表、执行器与内置工具
//! - **workflow**: 计划模型、依赖图、id 契约、合并视图

pub mod agent;
pub mod config;
pub mod core;
#[cfg(feature = "gateway")]
pub mod gateway;
pub mod llm;
pub mod mediator;
pub mod memory;
pub mod observability;
pub mod store;
pub mod tools;
pub mod workflow;

pub use core::{MediatorBuilder, OrchestratorError};
pub use mediator::Mediator;
