//! Agent：一个 Planner + 一个 Executor + 状态机
//!
//! 执行中（execution / pending 且仍有未决任务）时，每条输入（包括子 Agent 完成后的空消息唤醒）
//! 都直接进入执行器；否则先跑一轮需求收集，再视情况规划、执行或上报完成。

pub mod executor;
pub mod planner;
pub mod profile;
pub mod state;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{OrchestratorError, TaskScheduler};
use crate::llm::{CompletionError, CompletionService};
use crate::mediator::{EventKind, EventSink};
use crate::memory::{recent_window, Message};
use crate::store::{SessionKey, Stores};
use crate::tools::ToolExecutor;
use crate::workflow::{render_value, FailureCause, Observation, PlanMode, TaskId, TaskIdAllocator};

pub use executor::{Delegation, ExecutionOutcome, Executor, ExecutorSettings, SharedObservations};
pub use planner::{PlanAction, PlanContext, Planner};
pub use profile::AgentProfile;
pub use state::{AgentState, AgentStatus, ExecutionState};

const FALLBACK_REPLY: &str = "Sorry, I did not understand your request.";

/// 会话内所有 Agent 共享的依赖
#[derive(Clone)]
pub struct AgentRuntime {
    pub key: SessionKey,
    pub completion: Arc<dyn CompletionService>,
    pub tools: Arc<ToolExecutor>,
    pub scheduler: Arc<TaskScheduler>,
    pub stores: Stores,
    pub observations: SharedObservations,
    pub settings: ExecutorSettings,
    pub max_turns: usize,
}

/// 一次处理的上下文
pub struct Turn<'a> {
    pub cancel: &'a CancellationToken,
    pub events: &'a EventSink,
    /// 会话内其他 Agent 计划已占用的 id
    pub reserved_ids: &'a HashSet<TaskId>,
}

/// 一次处理的结果
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// 回复用户并等待下一条输入
    Reply(String),
    /// 生成了新一代计划，等待确认
    Planned { overview: String, summary: String },
    /// 需要 Mediator 压栈并驱动子 Agent
    Delegate(Delegation),
    /// 已委派，等待子 Agent 完成
    Waiting,
    /// 结果被接受，向上报告；message 为本轮回复
    Done { result: Value, message: String },
}

/// 需求轮的结构化回复
#[derive(Debug, Default, Deserialize)]
struct TurnReply {
    #[serde(default)]
    message: String,
    #[serde(default)]
    requirements: Option<Value>,
    #[serde(default)]
    plan_approved: Option<bool>,
    #[serde(default)]
    result_accepted: Option<bool>,
    #[serde(default)]
    changes_to_apply: Option<String>,
}

impl TurnReply {
    /// 空对象视为尚未收集到需求
    fn requirements(&self) -> Option<&Value> {
        self.requirements
            .as_ref()
            .filter(|v| !v.is_null() && v.as_object().map_or(true, |o| !o.is_empty()))
    }
}

pub struct Agent {
    profile: Arc<AgentProfile>,
    state: AgentState,
    planner: Planner,
    executor: Executor,
    runtime: AgentRuntime,
}

impl Agent {
    pub fn new(
        profile: Arc<AgentProfile>,
        state: AgentState,
        actions: Vec<PlanAction>,
        runtime: AgentRuntime,
    ) -> Self {
        let planner = Planner::new(
            Arc::clone(&runtime.completion),
            actions,
            profile.planner_examples.clone(),
            runtime.max_turns,
        );
        let executor = Executor::new(
            runtime.key.clone(),
            profile.name.clone(),
            Arc::clone(&runtime.tools),
            Arc::clone(&runtime.scheduler),
            runtime.stores.clone(),
            Arc::clone(&runtime.observations),
            runtime.settings.clone(),
        );
        Self {
            profile,
            state,
            planner,
            executor,
            runtime,
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub async fn save(&mut self) -> Result<(), OrchestratorError> {
        self.state.touch();
        self.runtime.stores.save_agent(&self.runtime.key, &self.state).await?;
        Ok(())
    }

    /// 接受父 Agent 的委派
    pub async fn assign(&mut self, task_id: &str) -> Result<(), OrchestratorError> {
        self.state.assign(task_id);
        self.save().await
    }

    /// 清除子 Agent 没能入栈的委派标记（标记已落盘、压栈前中断），下次执行时重新委派
    pub async fn forget_lost_delegations(&mut self) -> Result<Vec<TaskId>, OrchestratorError> {
        let execution = &mut self.state.execution;
        let lost: Vec<TaskId> = execution
            .delegated
            .iter()
            .filter(|id| !execution.child_results.contains_key(*id))
            .cloned()
            .collect();
        if lost.is_empty() {
            return Ok(lost);
        }
        for id in &lost {
            execution.delegated.remove(id);
        }
        self.save().await?;
        Ok(lost)
    }

    /// 子 Agent 完成：结果交给执行器收割，回到 execution
    pub async fn on_child_done(&mut self, task_id: &str, result: Value) -> Result<(), OrchestratorError> {
        self.state
            .execution
            .child_results
            .insert(task_id.to_string(), result);
        self.state.status = AgentStatus::Execution;
        self.save().await
    }

    pub async fn handle(&mut self, message: &str, turn: &Turn<'_>) -> Result<AgentOutcome, OrchestratorError> {
        self.executor.ensure_loaded().await?;

        if self.state.status == AgentStatus::Completed {
            // 已完成的 Agent 收到新输入：开始新一轮，计划代次保留
            self.state.restart();
        }

        if self.state.status.is_executing() && self.has_unresolved().await? {
            return self.execute(turn).await;
        }

        let reply = self.requirements_turn(message).await?;
        let key = self.runtime.key.clone();

        if reply.result_accepted == Some(true) && self.state.status == AgentStatus::WaitingForApproval {
            self.state.status = AgentStatus::Completed;
            self.save().await?;
            tracing::info!(session = %key, agent = %self.profile.name, "Result accepted");
            let result = self
                .state
                .last_result
                .clone()
                .unwrap_or_else(|| Value::String(reply.message.clone()));
            return Ok(AgentOutcome::Done {
                result,
                message: reply.message,
            });
        }

        let Some(requirements) = reply.requirements().cloned() else {
            self.save().await?;
            let text = if reply.message.is_empty() {
                FALLBACK_REPLY.to_string()
            } else {
                reply.message
            };
            return Ok(AgentOutcome::Reply(text));
        };

        if !reply.message.is_empty() {
            turn.events.message(&key, reply.message.clone());
        }

        let stored_missing = self.state.requirements.is_none();
        let changed = self.state.requirements_changed(&requirements);
        let approved = reply.plan_approved.unwrap_or(false);
        let has_plan = self.state.has_plan();
        // 交付结果后未被接受：按反馈重规划
        let rejected = self.state.status == AgentStatus::WaitingForApproval;
        if let Some(changes) = reply.changes_to_apply.as_deref().filter(|c| !c.trim().is_empty()) {
            tracing::debug!(session = %key, agent = %self.profile.name, changes = %changes, "Changes requested");
        }
        self.state.requirements = Some(requirements.clone());

        if !approved || changed || !has_plan || stored_missing || rejected {
            return self.plan(requirements, turn).await;
        }
        self.execute(turn).await
    }

    async fn has_unresolved(&self) -> Result<bool, OrchestratorError> {
        match self.state.latest_plan() {
            Some(plan) if !plan.tasks.is_empty() => Ok(self.executor.has_unresolved(&plan.tasks).await?),
            _ => Ok(false),
        }
    }

    async fn requirements_turn(&mut self, message: &str) -> Result<TurnReply, OrchestratorError> {
        self.state.status = match self.state.status {
            AgentStatus::WaitingForApproval => AgentStatus::WaitingForApproval,
            _ => AgentStatus::Questionnaire,
        };
        let schema = self.profile.turn_schema(
            self.state.has_plan(),
            self.state.status == AgentStatus::WaitingForApproval,
        );
        let completion = self
            .runtime
            .completion
            .complete(
                recent_window(&self.state.conversation_history, self.runtime.max_turns),
                &self.profile.prompt,
                message,
                Some(&schema),
            )
            .await?;
        let reply: TurnReply = serde_json::from_value(completion.into_structured()?)
            .map_err(|e| CompletionError::SchemaValidation(format!("{}: {e}", schema.name)))?;

        if !message.is_empty() {
            self.state.conversation_history.push(Message::user(message));
        }
        if !reply.message.is_empty() {
            self.state
                .conversation_history
                .push(Message::assistant(reply.message.clone()).from_agent(self.profile.name.clone()));
        }
        Ok(reply)
    }

    async fn plan(&mut self, requirements: Value, turn: &Turn<'_>) -> Result<AgentOutcome, OrchestratorError> {
        let key = self.runtime.key.clone();
        let mode = if !self.state.has_plan() {
            PlanMode::Fresh
        } else if self.state.status == AgentStatus::WaitingForApproval {
            PlanMode::ReplanAfterExecution
        } else {
            PlanMode::ReplanBeforeExecution
        };

        self.state.status = AgentStatus::Planning;
        self.save().await?;
        turn.events.emit(&key, EventKind::PlanningStarted, Value::Null);
        tracing::info!(session = %key, agent = %self.profile.name, mode = ?mode, "Planning started");

        let cached: HashSet<TaskId> = self.runtime.observations.read().await.keys().cloned().collect();
        let mut allocator = TaskIdAllocator::new(
            turn.reserved_ids
                .iter()
                .chain(cached.iter())
                .chain(self.state.task_ids())
                .cloned(),
        );
        let previous = match (mode, self.state.latest_plan()) {
            (PlanMode::ReplanAfterExecution, Some(plan)) => self.executor.tasks_with_results(&plan.tasks).await,
            _ => Vec::new(),
        };

        let mut planner_history = std::mem::take(&mut self.state.planner_history);
        let created = self
            .planner
            .create_plan(
                &mut planner_history,
                &requirements,
                mode,
                PlanContext {
                    previous: &previous,
                    executed_requirements: self.state.executed_requirements.as_ref(),
                    allocator: &mut allocator,
                    external: &cached,
                },
            )
            .await;
        self.state.planner_history = planner_history;
        let plan = match created {
            Ok(plan) => plan,
            Err(e) => {
                self.state.status = AgentStatus::Questionnaire;
                self.save().await?;
                return Err(e);
            }
        };

        let overview = plan
            .overview
            .clone()
            .unwrap_or_else(|| "I prepared a plan. Do you want me to proceed?".to_string());
        let summary = requirements
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| overview.clone());
        self.state.push_plan(plan);
        self.state.execution = ExecutionState::default();
        self.state
            .conversation_history
            .push(Message::assistant(overview.clone()).from_agent(self.profile.name.clone()));
        self.save().await?;
        Ok(AgentOutcome::Planned { overview, summary })
    }

    async fn execute(&mut self, turn: &Turn<'_>) -> Result<AgentOutcome, OrchestratorError> {
        let key = self.runtime.key.clone();
        let Some(tasks) = self.state.latest_plan().map(|p| p.tasks.clone()) else {
            return Ok(AgentOutcome::Reply(FALLBACK_REPLY.to_string()));
        };

        if !self.state.status.is_executing() {
            self.state.status = AgentStatus::Execution;
            self.state.executed_requirements = self.state.requirements.clone();
            turn.events.emit(&key, EventKind::ExecutionStarted, Value::Null);
            tracing::info!(session = %key, agent = %self.profile.name, tasks = tasks.len(), "Execution started");
        }

        let outcome = self.executor.resume(&tasks, &mut self.state, turn.cancel).await;
        if let Some(plan) = self.state.latest_plan_mut() {
            self.executor.attach_results(&mut plan.tasks).await;
        }
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // 工具历史与委派记录仍需落盘
                self.save().await?;
                return Err(e);
            }
        };

        let result = match outcome {
            ExecutionOutcome::Suspended(Some(delegation)) => {
                self.state.status = AgentStatus::Pending;
                self.save().await?;
                return Ok(AgentOutcome::Delegate(delegation));
            }
            ExecutionOutcome::Suspended(None) => {
                self.state.status = AgentStatus::Pending;
                self.save().await?;
                return Ok(AgentOutcome::Waiting);
            }
            ExecutionOutcome::Completed { value, .. } => {
                let text = render_value(&value);
                self.state.last_result = Some(value);
                text
            }
            ExecutionOutcome::Failed { task_id, cause } => {
                tracing::warn!(session = %key, agent = %self.profile.name, task_id = %task_id, %cause, "Plan failed");
                self.state.last_result = None;
                self.describe_failure(&task_id, cause).await
            }
        };

        self.state.status = AgentStatus::WaitingForApproval;
        self.state
            .conversation_history
            .push(Message::assistant(result.clone()).from_agent(self.profile.name.clone()));
        self.save().await?;
        Ok(AgentOutcome::Reply(result))
    }

    /// 沿 DependencyFailed 链找到最初失败的任务
    async fn describe_failure(&self, task_id: &str, cause: FailureCause) -> String {
        let mut text = format!("Task {task_id} failed: {cause}");
        let mut current = cause;
        let mut seen = HashSet::new();
        while let FailureCause::DependencyFailed { task_id: upstream } = current {
            if !seen.insert(upstream.clone()) {
                break;
            }
            match self.executor.observation(&upstream).await {
                Some(Observation::Failed { cause }) => {
                    if !matches!(cause, FailureCause::DependencyFailed { .. }) {
                        text.push_str(&format!(" (task {upstream}: {cause})"));
                    }
                    current = cause;
                }
                _ => break,
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedCompletion;
    use crate::tools::{JoinTool, ToolRegistry};
    use crate::workflow::TaskKind;
    use serde_json::json;

    fn agent(service: Arc<ScriptedCompletion>) -> (Agent, AgentRuntime) {
        let mut registry = ToolRegistry::new();
        registry.register(JoinTool);
        let runtime = AgentRuntime {
            key: SessionKey::new("c", "1"),
            completion: service,
            tools: Arc::new(ToolExecutor::new(registry, 5)),
            scheduler: Arc::new(TaskScheduler::new(2)),
            stores: Stores::in_memory(),
            observations: SharedObservations::default(),
            settings: ExecutorSettings::default(),
            max_turns: 10,
        };
        let actions = vec![PlanAction {
            name: "caption_agent".into(),
            description: "Writes captions".into(),
            kind: TaskKind::Agent,
        }];
        let agent = Agent::new(
            Arc::new(AgentProfile::new("init_agent")),
            AgentState::new("init_agent"),
            actions,
            runtime.clone(),
        );
        (agent, runtime)
    }

    fn turn<'a>(cancel: &'a CancellationToken, events: &'a EventSink, reserved: &'a HashSet<TaskId>) -> Turn<'a> {
        Turn {
            cancel,
            events,
            reserved_ids: reserved,
        }
    }

    #[tokio::test]
    async fn test_reply_without_requirements() {
        let service = Arc::new(ScriptedCompletion::new());
        service.push_structured(json!({"message": "What is the post about?"}));
        let (mut agent, runtime) = agent(service);
        let (cancel, events, reserved) = (CancellationToken::new(), EventSink::default(), HashSet::new());

        let out = agent.handle("hi", &turn(&cancel, &events, &reserved)).await.unwrap();

        assert_eq!(out, AgentOutcome::Reply("What is the post about?".into()));
        assert_eq!(agent.state().conversation_history.len(), 2);
        let saved = runtime.stores.load_agent(&runtime.key, "init_agent").await.unwrap().unwrap();
        assert_eq!(saved.status, AgentStatus::Questionnaire);
    }

    #[tokio::test]
    async fn test_plan_then_approve_then_delegate() {
        let service = Arc::new(ScriptedCompletion::new());
        service
            .push_structured(json!({"message": "Got it", "requirements": {"summary": "User decided to post cats"}}))
            .push_structured(json!({
                "tasks": [
                    {"id": "12345678", "tool": "caption_agent", "arguments": [{"name": "topic", "value": "cats"}]},
                    {"id": "23456789", "tool": "join", "dependencies": ["12345678"]}
                ],
                "overview": "I will delegate the caption. OK?"
            }))
            .push_structured(json!({
                "message": "Starting",
                "requirements": {"summary": "User decided to post cats"},
                "plan_approved": true
            }));
        let (mut agent, _) = agent(service);
        let (cancel, events, reserved) = (CancellationToken::new(), EventSink::default(), HashSet::new());
        let mut rx = events.subscribe();

        let planned = agent.handle("cats post", &turn(&cancel, &events, &reserved)).await.unwrap();
        assert_eq!(
            planned,
            AgentOutcome::Planned {
                overview: "I will delegate the caption. OK?".into(),
                summary: "User decided to post cats".into()
            }
        );
        assert_eq!(agent.state().status, AgentStatus::Planning);

        let next = agent.handle("yes", &turn(&cancel, &events, &reserved)).await.unwrap();
        let AgentOutcome::Delegate(delegation) = next else {
            panic!("expected delegation, got {next:?}");
        };
        assert_eq!(delegation.task_id, "12345678");
        assert_eq!(agent.state().status, AgentStatus::Pending);

        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::PlanningStarted));
        assert!(kinds.contains(&EventKind::ExecutionStarted));
    }

    #[tokio::test]
    async fn test_executing_agent_ignores_free_text_and_harvests() {
        let service = Arc::new(ScriptedCompletion::new());
        let (mut agent, _) = agent(service.clone());
        agent.state_mut().requirements = Some(json!({"summary": "s"}));
        agent.state_mut().push_plan(crate::workflow::Plan::new(
            vec![
                crate::workflow::Task::agent("1", "caption_agent"),
                crate::workflow::Task::join("2").depends_on(["1"]),
            ],
            None,
            PlanMode::Fresh,
        ));
        agent.state_mut().status = AgentStatus::Pending;
        agent.state_mut().execution.delegated.insert("1".into());
        let (cancel, events, reserved) = (CancellationToken::new(), EventSink::default(), HashSet::new());

        // 仍在等待子 Agent：不调用补全服务
        let waiting = agent.handle("are you done?", &turn(&cancel, &events, &reserved)).await.unwrap();
        assert_eq!(waiting, AgentOutcome::Waiting);
        assert!(service.requests().is_empty());

        agent.on_child_done("1", json!("A caption")).await.unwrap();
        let out = agent.handle("", &turn(&cancel, &events, &reserved)).await.unwrap();
        assert_eq!(out, AgentOutcome::Reply("A caption".into()));
        assert_eq!(agent.state().status, AgentStatus::WaitingForApproval);
        assert_eq!(agent.state().last_result, Some(json!("A caption")));
        assert!(agent.state().latest_plan().unwrap().tasks[0].result.is_some());
    }

    #[tokio::test]
    async fn test_accepting_result_reports_done() {
        let service = Arc::new(ScriptedCompletion::new());
        service.push_structured(json!({"message": "Great!", "result_accepted": true}));
        let (mut agent, _) = agent(service.clone());
        agent.state_mut().status = AgentStatus::WaitingForApproval;
        agent.state_mut().last_result = Some(json!("final"));
        let (cancel, events, reserved) = (CancellationToken::new(), EventSink::default(), HashSet::new());

        let out = agent.handle("love it", &turn(&cancel, &events, &reserved)).await.unwrap();
        assert_eq!(
            out,
            AgentOutcome::Done {
                result: json!("final"),
                message: "Great!".into()
            }
        );
        assert_eq!(agent.state().status, AgentStatus::Completed);
        assert_eq!(service.requests()[0].schema.as_deref(), Some("init_agent_turn"));
    }

    #[tokio::test]
    async fn test_invalid_turn_reply_is_validation_error() {
        let service = Arc::new(ScriptedCompletion::new());
        service.push_structured(json!({"requirements": {"a": 1}}));
        let (mut agent, _) = agent(service);
        let (cancel, events, reserved) = (CancellationToken::new(), EventSink::default(), HashSet::new());
        let err = agent.handle("x", &turn(&cancel, &events, &reserved)).await.unwrap_err();
        assert!(err.is_validation());
    }
}
