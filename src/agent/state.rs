//! Agent 状态
//!
//! 每个 (client, chat, agent) 一份，由 Agent 独占并在每次状态变化后持久化到 ConversationStore。

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::Message;
use crate::workflow::{Plan, TaskId};

/// Agent 状态机
///
/// questionnaire → planning → execution → waiting_for_approval → completed；
/// 等待子 Agent 时 execution ⇄ pending。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Questionnaire,
    Planning,
    Execution,
    Pending,
    WaitingForApproval,
    Completed,
}

impl AgentStatus {
    /// 执行中（含等待子 Agent）：用户输入直接进入执行器，不再解析为新意图
    pub fn is_executing(self) -> bool {
        matches!(self, AgentStatus::Execution | AgentStatus::Pending)
    }
}

/// 执行器的持久化部分：委派记录与子 Agent 回传的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// 已委派给子 Agent、尚未收割结果的任务
    #[serde(default)]
    pub delegated: BTreeSet<TaskId>,
    /// onAgentDone 注入、等待父执行器收割的结果
    #[serde(default)]
    pub child_results: BTreeMap<TaskId, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub name: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub requirements: Option<Value>,
    /// 上次执行时的需求（执行后重规划的上下文）
    #[serde(default)]
    pub executed_requirements: Option<Value>,
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    #[serde(default)]
    pub planner_history: Vec<Message>,
    /// 工具名 -> 该工具在本 Agent 下的私有对话历史
    #[serde(default)]
    pub tool_histories: BTreeMap<String, Vec<Message>>,
    /// 全部计划代次，最后一代为当前计划
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub execution: ExecutionState,
    /// 作为子 Agent 时正在处理的父任务 id
    #[serde(default)]
    pub assigned_task: Option<TaskId>,
    #[serde(default)]
    pub last_result: Option<Value>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AgentStatus::default(),
            requirements: None,
            executed_requirements: None,
            conversation_history: Vec::new(),
            planner_history: Vec::new(),
            tool_histories: BTreeMap::new(),
            plans: Vec::new(),
            execution: ExecutionState::default(),
            assigned_task: None,
            last_result: None,
            updated_at: Utc::now(),
        }
    }

    pub fn latest_plan(&self) -> Option<&Plan> {
        self.plans.last()
    }

    pub fn latest_plan_mut(&mut self) -> Option<&mut Plan> {
        self.plans.last_mut()
    }

    pub fn has_plan(&self) -> bool {
        self.plans.last().is_some_and(|p| !p.tasks.is_empty())
    }

    pub fn push_plan(&mut self, plan: Plan) {
        self.plans.push(plan);
    }

    /// 本 Agent 各代计划用过的全部 id
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.plans.iter().flat_map(|p| p.tasks.iter().map(|t| &t.id))
    }

    /// 需求是否变化：未保存过需求视为未变化；对象逐字段比较
    pub fn requirements_changed(&self, new: &Value) -> bool {
        let Some(old) = &self.requirements else {
            return false;
        };
        match (old, new) {
            (Value::Object(a), Value::Object(b)) => a
                .keys()
                .chain(b.keys())
                .any(|k| a.get(k).unwrap_or(&Value::Null) != b.get(k).unwrap_or(&Value::Null)),
            _ => old != new,
        }
    }

    /// 接受一次新的委派：开始新一轮，保留历史与计划代次
    pub fn assign(&mut self, task_id: impl Into<TaskId>) {
        self.assigned_task = Some(task_id.into());
        self.restart();
    }

    /// 开始新一轮需求收集
    pub fn restart(&mut self) {
        self.status = AgentStatus::Questionnaire;
        self.requirements = None;
        self.last_result = None;
        self.execution = ExecutionState::default();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{PlanMode, Task};
    use serde_json::json;

    #[test]
    fn test_requirements_changed() {
        let mut state = AgentState::new("init_agent");
        assert!(!state.requirements_changed(&json!({"topic": "cats"})));

        state.requirements = Some(json!({"topic": "cats", "tone": "fun"}));
        assert!(!state.requirements_changed(&json!({"tone": "fun", "topic": "cats"})));
        assert!(state.requirements_changed(&json!({"topic": "dogs", "tone": "fun"})));
        assert!(state.requirements_changed(&json!({"topic": "cats"})));
        assert!(!state.requirements_changed(&json!({"topic": "cats", "tone": "fun", "extra": null})));
    }

    #[test]
    fn test_assign_resets_round_but_keeps_plans() {
        let mut state = AgentState::new("caption_agent");
        state.status = AgentStatus::Completed;
        state.requirements = Some(json!({"a": 1}));
        state.push_plan(Plan::new(vec![Task::tool("1", "caption")], None, PlanMode::Fresh));
        state.execution.delegated.insert("9".into());

        state.assign("42");

        assert_eq!(state.status, AgentStatus::Questionnaire);
        assert_eq!(state.assigned_task.as_deref(), Some("42"));
        assert!(state.requirements.is_none());
        assert!(state.execution.delegated.is_empty());
        assert_eq!(state.task_ids().count(), 1);
    }

    #[test]
    fn test_state_roundtrip_with_defaults() {
        let state: AgentState = serde_json::from_value(json!({"name": "a"})).unwrap();
        assert_eq!(state.status, AgentStatus::Questionnaire);
        assert!(state.plans.is_empty());
    }
}
