//! 计划模型：任务类型、依赖图、id 契约、合并视图

pub mod graph;
pub mod ids;
pub mod merged;
pub mod types;

pub use graph::PlanGraph;
pub use ids::{assign_fresh_ids, enforce_replan_contract, IdReport, TaskIdAllocator};
pub use merged::{MergedPlanView, MergedTask};
pub use types::*;
