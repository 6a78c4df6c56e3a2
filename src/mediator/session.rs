//! 单个会话的运行时：调用栈、委派、子 Agent 结果回传与合并计划视图
//!
//! 委派不递归：Agent 返回 Delegate / Done 后，由 handle_message 中的循环决定下一个要驱动的 Agent。
//! 同一会话的所有调用都由 Mediator 的会话 worker 串行执行。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::agent::{
    Agent, AgentOutcome, AgentProfile, AgentRuntime, AgentState, Delegation, PlanAction, Turn,
};
use crate::core::OrchestratorError;
use crate::mediator::events::{EventKind, EventSink};
use crate::mediator::history;
use crate::memory::Message;
use crate::store::SessionKey;
use crate::tools::ToolRegistry;
use crate::workflow::{render_value, MergedPlanView, TaskId, TaskKind, JOIN_TOOL};

/// 已配置的 Agent 档案与默认入口 Agent
#[derive(Debug, Clone)]
pub struct AgentCatalog {
    profiles: HashMap<String, Arc<AgentProfile>>,
    default_agent: String,
}

impl AgentCatalog {
    pub fn new(profiles: impl IntoIterator<Item = AgentProfile>, default_agent: impl Into<String>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
            default_agent: default_agent.into(),
        }
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn profile(&self, name: &str) -> Option<Arc<AgentProfile>> {
        self.profiles.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Planner 可用的动作：工具（不含 join，由 Planner 自行追加）与可委派的子 Agent
    pub fn actions_for(&self, profile: &AgentProfile, registry: &ToolRegistry) -> Vec<PlanAction> {
        let mut actions: Vec<PlanAction> = if profile.tools.is_empty() {
            registry
                .tool_descriptions()
                .into_iter()
                .filter(|(name, _)| name != JOIN_TOOL)
                .map(|(name, description)| PlanAction {
                    name,
                    description,
                    kind: TaskKind::Tool,
                })
                .collect()
        } else {
            profile
                .tools
                .iter()
                .filter(|name| name.as_str() != JOIN_TOOL)
                .map(|name| {
                    let description = registry
                        .get(name)
                        .map(|t| t.description().to_string())
                        .unwrap_or_else(|| {
                            tracing::warn!(agent = %profile.name, tool = %name, "Profile lists an unregistered tool");
                            String::new()
                        });
                    PlanAction {
                        name: name.clone(),
                        description,
                        kind: TaskKind::Tool,
                    }
                })
                .collect()
        };

        for delegate in &profile.delegates {
            match self.profiles.get(delegate) {
                Some(child) => actions.push(PlanAction {
                    name: child.name.clone(),
                    description: child.description.clone(),
                    kind: TaskKind::Agent,
                }),
                None => {
                    tracing::warn!(agent = %profile.name, delegate = %delegate, "Profile delegates to an unknown agent");
                }
            }
        }
        actions
    }
}

/// 循环中的下一步：把消息交给某个 Agent
struct Deliver {
    agent: String,
    message: String,
}

pub struct SessionRuntime {
    catalog: Arc<AgentCatalog>,
    runtime: AgentRuntime,
    events: EventSink,
    agents: BTreeMap<String, Agent>,
    stack: Vec<String>,
    merged: MergedPlanView,
    loaded: bool,
}

impl SessionRuntime {
    pub fn new(catalog: Arc<AgentCatalog>, runtime: AgentRuntime, events: EventSink) -> Self {
        Self {
            catalog,
            runtime,
            events,
            agents: BTreeMap::new(),
            stack: Vec::new(),
            merged: MergedPlanView::new(),
            loaded: false,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.runtime.key
    }

    pub fn call_stack(&self) -> &[String] {
        &self.stack
    }

    pub fn merged_plan(&self) -> &MergedPlanView {
        &self.merged
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    /// 首次使用时从存储恢复调用栈与全部 Agent 状态
    pub async fn load(&mut self) -> Result<(), OrchestratorError> {
        if self.loaded {
            return Ok(());
        }
        let key = self.runtime.key.clone();
        self.stack = self.runtime.stores.load_stack(&key).await?;
        for state in self.runtime.stores.load_agents(&key).await? {
            if self.catalog.contains(&state.name) {
                let name = state.name.clone();
                let agent = self.build_agent(&name, state)?;
                self.agents.insert(name, agent);
            } else {
                tracing::warn!(session = %key, agent = %state.name, "Stored agent has no profile; ignoring");
            }
        }
        self.rebuild_merged_plan();
        self.loaded = true;
        if !self.stack.is_empty() || !self.agents.is_empty() {
            tracing::info!(session = %key, stack = ?self.stack, agents = self.agents.len(), "Session restored");
        }
        Ok(())
    }

    fn build_agent(&self, name: &str, state: AgentState) -> Result<Agent, OrchestratorError> {
        let profile = self
            .catalog
            .profile(name)
            .ok_or_else(|| OrchestratorError::UnknownAgent(name.to_string()))?;
        let actions = self.catalog.actions_for(&profile, self.runtime.tools.registry());
        Ok(Agent::new(profile, state, actions, self.runtime.clone()))
    }

    fn agent_mut(&mut self, name: &str) -> Result<&mut Agent, OrchestratorError> {
        if !self.agents.contains_key(name) {
            let agent = self.build_agent(name, AgentState::new(name))?;
            self.agents.insert(name.to_string(), agent);
        }
        self.agents
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::UnknownAgent(name.to_string()))
    }

    /// 会话内所有 Agent 计划用过的 id
    fn reserved_ids(&self) -> HashSet<TaskId> {
        self.agents
            .values()
            .flat_map(|a| a.state().task_ids().cloned())
            .collect()
    }

    async fn save_stack(&self) -> Result<(), OrchestratorError> {
        self.runtime.stores.save_stack(&self.runtime.key, &self.stack).await?;
        Ok(())
    }

    /// 把用户消息交给栈顶 Agent，并驱动由此引发的委派 / 回传，直到需要等待用户输入
    pub async fn handle_message(&mut self, text: &str, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        self.load().await?;
        if self.stack.is_empty() {
            let entry = self.catalog.default_agent().to_string();
            tracing::info!(session = %self.runtime.key, agent = %entry, "Pushing entry agent");
            self.stack.push(entry);
            self.save_stack().await?;
        }
        self.recover_lost_delegation().await?;

        let mut next = self.stack.last().cloned().map(|agent| Deliver {
            agent,
            message: text.to_string(),
        });

        while let Some(step) = next.take() {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            let reserved = self.reserved_ids();
            let events = self.events.clone();
            let turn = Turn {
                cancel,
                events: &events,
                reserved_ids: &reserved,
            };
            let outcome = self.agent_mut(&step.agent)?.handle(&step.message, &turn).await?;
            next = self.apply(&step.agent, outcome).await?;
        }
        Ok(())
    }

    /// 栈顶 Agent 仍记着未收割的委派，说明子 Agent 没能入栈；清掉标记让它重新委派
    async fn recover_lost_delegation(&mut self) -> Result<(), OrchestratorError> {
        let Some(top) = self.stack.last().cloned() else {
            return Ok(());
        };
        let Some(agent) = self.agents.get_mut(&top) else {
            return Ok(());
        };
        let lost = agent.forget_lost_delegations().await?;
        if !lost.is_empty() {
            tracing::warn!(session = %self.runtime.key, agent = %top, tasks = ?lost, "Delegated child missing from call stack; delegating again");
        }
        Ok(())
    }

    async fn apply(&mut self, agent: &str, outcome: AgentOutcome) -> Result<Option<Deliver>, OrchestratorError> {
        let key = self.runtime.key.clone();
        match outcome {
            AgentOutcome::Reply(text) => {
                self.events.message(&key, text);
                Ok(None)
            }
            AgentOutcome::Planned { overview, summary } => {
                self.emit_plan(agent, &summary);
                self.events.message(&key, overview);
                Ok(None)
            }
            AgentOutcome::Waiting => {
                tracing::debug!(session = %key, agent = %agent, "Agent is waiting on a delegated task");
                Ok(None)
            }
            AgentOutcome::Delegate(delegation) => self.delegate(agent, delegation).await.map(Some),
            AgentOutcome::Done { result, message } => {
                if !message.is_empty() {
                    self.events.message(&key, message);
                }
                self.on_agent_done(agent, result).await
            }
        }
    }

    /// 压入子 Agent、持久化调用栈，并把参数文本作为子 Agent 的第一条消息
    async fn delegate(&mut self, parent: &str, delegation: Delegation) -> Result<Deliver, OrchestratorError> {
        let Delegation {
            task_id,
            agent: child,
            arguments_text,
        } = delegation;
        if !self.catalog.contains(&child) {
            return Err(OrchestratorError::UnknownAgent(child));
        }
        if self.stack.contains(&child) {
            return Err(OrchestratorError::ConfigError(format!(
                "agent {child} is already on the call stack"
            )));
        }

        // 先落盘子 Agent 的任务，再压栈；中断时父 Agent 的委派标记由 recover_lost_delegation 清理
        self.agent_mut(&child)?.assign(&task_id).await?;
        self.stack.push(child.clone());
        if let Err(e) = self.save_stack().await {
            self.stack.pop();
            return Err(e);
        }
        tracing::info!(
            session = %self.runtime.key,
            parent = %parent,
            child = %child,
            task_id = %task_id,
            depth = self.stack.len(),
            "Delegation pushed"
        );

        Ok(Deliver {
            agent: child,
            message: arguments_text,
        })
    }

    /// 弹出最上面的同名栈项；若还有父 Agent，把结果注入它并用空消息唤醒
    async fn on_agent_done(&mut self, agent: &str, result: Value) -> Result<Option<Deliver>, OrchestratorError> {
        let key = self.runtime.key.clone();
        if let Some(pos) = self.stack.iter().rposition(|a| a == agent) {
            self.stack.remove(pos);
            self.save_stack().await?;
        }
        tracing::info!(session = %key, agent = %agent, depth = self.stack.len(), "Delegation popped");

        let assigned = self.agents.get(agent).and_then(|a| a.state().assigned_task.clone());
        let (Some(parent), Some(task_id)) = (self.stack.last().cloned(), assigned) else {
            if self.stack.is_empty() {
                tracing::info!(session = %key, result = %render_value(&result), "Session task completed");
            }
            return Ok(None);
        };

        self.agent_mut(&parent)?.on_child_done(&task_id, result).await?;
        Ok(Some(Deliver {
            agent: parent,
            message: String::new(),
        }))
    }

    /// 更新合并计划视图并广播
    fn emit_plan(&mut self, agent: &str, summary: &str) {
        let parent_task = self.parent_task_of(agent);
        let Some(tasks) = self
            .agents
            .get(agent)
            .and_then(|a| a.state().latest_plan())
            .map(|p| p.tasks.clone())
        else {
            return;
        };
        self.merged
            .replace_subtree(agent, &tasks, parent_task.as_deref());
        self.events.emit(
            &self.runtime.key,
            EventKind::Plan,
            json!({
                "agent": agent,
                "summary": summary,
                "tasks": self.merged.tasks(),
            }),
        );
    }

    /// 非栈底 Agent 的父任务 id
    fn parent_task_of(&self, agent: &str) -> Option<TaskId> {
        let pos = self.stack.iter().rposition(|a| a == agent)?;
        if pos == 0 {
            return None;
        }
        self.agents.get(agent).and_then(|a| a.state().assigned_task.clone())
    }

    fn rebuild_merged_plan(&mut self) {
        let mut merged = MergedPlanView::new();
        for agent in &self.stack {
            let Some(state) = self.agents.get(agent).map(Agent::state) else {
                continue;
            };
            let Some(plan) = state.latest_plan() else {
                continue;
            };
            merged.replace_subtree(agent, &plan.tasks, self.parent_task_of(agent).as_deref());
        }
        self.merged = merged;
    }

    /// 合并后的可见历史
    pub async fn history(&mut self) -> Result<Vec<Message>, OrchestratorError> {
        self.load().await?;
        let states: Vec<AgentState> = self.agents.values().map(|a| a.state().clone()).collect();
        Ok(history::project(&states))
    }

    /// 从所有 Agent 的历史中删除内容相同的消息，返回删除条数
    pub async fn delete_message(&mut self, content: &str) -> Result<usize, OrchestratorError> {
        self.load().await?;
        let mut removed = 0;
        for agent in self.agents.values_mut() {
            let n = history::remove_matching(&mut agent.state_mut().conversation_history, content);
            if n > 0 {
                removed += n;
                agent.save().await?;
            }
        }
        if removed > 0 {
            tracing::info!(session = %self.runtime.key, removed, "Deleted messages from history");
        }
        Ok(removed)
    }
}
