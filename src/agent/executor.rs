//! 计划执行器
//!
//! 一次 execute_plan 循环若干轮，每轮：
//! 1. 依赖已失败的任务直接记为 DependencyFailed（短路传播）
//! 2. 可运行的工具任务并发启动；每个任务等待依赖的就绪信号（watch 通道，带超时），
//!    完成后先持久化、再写入观测缓存、最后发出就绪信号
//! 3. join 完成即返回，不等待与 join 无关的工具任务；它们留在后台集合里，
//!    下一次进入 execute_plan 时先等其结束并补记工具历史
//! 4. Agent 任务逐个串行处理：收割子 Agent 结果，或发起委派并返回 Suspended
//!
//! 委派不阻塞：执行器返回 `ExecutionOutcome::Suspended`，由 Mediator 压栈并驱动子 Agent，
//! 子 Agent 完成后结果注入 `AgentState.execution.child_results`，父 Agent 再次进入 execute_plan 时收割。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentState;
use crate::core::{OrchestratorError, TaskScheduler};
use crate::memory::Message;
use crate::store::{SessionKey, StoreError, Stores};
use crate::tools::{ToolContext, ToolExecutor};
use crate::workflow::{
    render_value, Argument, FailureCause, Observation, PlanGraph, Task, TaskId, TaskKind,
    TaskRecord, TaskWithResult,
};

/// 会话级观测缓存（同一会话的所有 Agent 共享）
pub type SharedObservations = Arc<RwLock<HashMap<TaskId, Observation>>>;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// 单个工具任务等待依赖就绪的上限
    pub dependency_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            dependency_timeout: Duration::from_secs(300),
        }
    }
}

/// 委派请求：由 Mediator 压栈并作为子 Agent 的第一条消息发送
#[derive(Debug, Clone, PartialEq)]
pub struct Delegation {
    pub task_id: TaskId,
    pub agent: String,
    pub arguments_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// 等待子 Agent；Some 表示需要发起新的委派，None 表示已委派、仍在等待
    Suspended(Option<Delegation>),
    Completed { task_id: TaskId, value: Value },
    Failed { task_id: TaskId, cause: FailureCause },
}

enum AgentStep {
    Suspend(Option<Delegation>),
    Progressed,
    Idle,
}

/// 工具任务完成后回报给执行器的信息（用于追加工具私有历史）
struct Finished {
    task_id: TaskId,
    tool: String,
    context_text: String,
    observation: Observation,
}

type JobResult = Result<Option<Finished>, StoreError>;

#[derive(Clone)]
pub struct Executor {
    key: SessionKey,
    agent: String,
    tools: Arc<ToolExecutor>,
    scheduler: Arc<TaskScheduler>,
    stores: Stores,
    observations: SharedObservations,
    settings: ExecutorSettings,
    /// 正在运行的工具任务（含 join 完成后仍未结束的）
    jobs: Arc<Mutex<JoinSet<JobResult>>>,
}

impl Executor {
    pub fn new(
        key: SessionKey,
        agent: impl Into<String>,
        tools: Arc<ToolExecutor>,
        scheduler: Arc<TaskScheduler>,
        stores: Stores,
        observations: SharedObservations,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            key,
            agent: agent.into(),
            tools,
            scheduler,
            stores,
            observations,
            settings,
            jobs: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub async fn observation(&self, task_id: &str) -> Option<Observation> {
        self.observations.read().await.get(task_id).cloned()
    }

    async fn snapshot(&self) -> HashMap<TaskId, Observation> {
        self.observations.read().await.clone()
    }

    /// 内存缓存为空时（如进程重启后）从 TaskResultStore 重新加载
    pub async fn ensure_loaded(&self) -> Result<(), StoreError> {
        if !self.observations.read().await.is_empty() {
            return Ok(());
        }
        let records = self.stores.load_results(&self.key).await?;
        if records.is_empty() {
            return Ok(());
        }
        let count = records.len();
        let mut cache = self.observations.write().await;
        for record in records {
            cache.entry(record.task_id).or_insert(record.observation);
        }
        tracing::info!(session = %self.key, agent = %self.agent, count, "Reloaded observations from store");
        Ok(())
    }

    /// 持久化后写入缓存
    async fn record(&self, task_id: &str, observation: Observation) -> Result<(), StoreError> {
        persist_then_cache(&self.stores, &self.key, &self.observations, task_id, &observation).await
    }

    /// 计划中是否还有未得到结果的任务
    pub async fn has_unresolved(&self, tasks: &[Task]) -> Result<bool, StoreError> {
        self.ensure_loaded().await?;
        let cache = self.observations.read().await;
        Ok(tasks.iter().any(|t| !cache.contains_key(&t.id)))
    }

    /// 只读投影：{task, result|null}
    pub async fn tasks_with_results(&self, tasks: &[Task]) -> Vec<TaskWithResult> {
        let cache = self.observations.read().await;
        tasks
            .iter()
            .map(|t| TaskWithResult {
                task: t.clone(),
                result: cache.get(&t.id).cloned(),
            })
            .collect()
    }

    /// 把已有结果写回任务（每个任务只写一次）
    pub async fn attach_results(&self, tasks: &mut [Task]) {
        let cache = self.observations.read().await;
        for task in tasks.iter_mut().filter(|t| t.result.is_none()) {
            task.result = cache.get(&task.id).cloned();
        }
    }

    /// 重启安全的入口：必要时重载观测缓存，再执行计划
    pub async fn resume(
        &self,
        tasks: &[Task],
        state: &mut AgentState,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        self.ensure_loaded().await?;
        self.execute_plan(tasks, state, cancel).await
    }

    pub async fn execute_plan(
        &self,
        tasks: &[Task],
        state: &mut AgentState,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let graph = PlanGraph::new(tasks);
        let order = graph.topological_order()?;
        self.collect_leftover_jobs(state).await?;

        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            self.propagate_failures(&order).await?;
            self.run_tool_batch(&graph, &order, state, cancel).await?;
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if let Some(outcome) = self.join_outcome(&graph).await {
                return Ok(outcome);
            }
            match self.run_agent_tasks(&graph, &order, state).await? {
                AgentStep::Suspend(delegation) => return Ok(ExecutionOutcome::Suspended(delegation)),
                AgentStep::Progressed => continue,
                AgentStep::Idle => return Ok(self.settle(&graph, &order, state).await),
            }
        }
    }

    /// 等待上一次 join 之后仍在运行的工具任务，并补记它们的工具历史
    async fn collect_leftover_jobs(&self, state: &mut AgentState) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.is_empty() {
            return Ok(());
        }
        tracing::debug!(session = %self.key, agent = %self.agent, count = jobs.len(), "Waiting for tool tasks left over from last run");
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(result) => {
                    if let Some(finished) = result? {
                        record_history(state, &finished);
                    }
                }
                Err(e) => tracing::warn!(session = %self.key, "Tool task aborted: {}", e),
            }
        }
        Ok(())
    }

    /// 依赖已失败的未决任务记为 DependencyFailed（拓扑序一遍即可级联）
    async fn propagate_failures(&self, order: &[&Task]) -> Result<(), StoreError> {
        for task in order {
            let failed_dep = {
                let cache = self.observations.read().await;
                if cache.contains_key(&task.id) {
                    continue;
                }
                task.dependencies
                    .iter()
                    .find(|d| cache.get(d.as_str()).is_some_and(Observation::is_failed))
                    .cloned()
            };
            if let Some(dep) = failed_dep {
                tracing::warn!(session = %self.key, task_id = %task.id, dependency = %dep, "Dependency failed, short-circuiting task");
                self.record(&task.id, Observation::failed(FailureCause::DependencyFailed { task_id: dep }))
                    .await?;
            }
        }
        Ok(())
    }

    /// 启动本轮所有可运行的工具任务并等待它们结束（join 完成时提前返回）
    async fn run_tool_batch(
        &self,
        graph: &PlanGraph<'_>,
        order: &[&Task],
        state: &mut AgentState,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let cache = self.snapshot().await;

        // 依赖均已完成，或依赖本身也在本批次内
        let mut launch: Vec<&Task> = Vec::new();
        let mut launch_ids: HashSet<&str> = HashSet::new();
        for task in order.iter().copied() {
            if task.kind != TaskKind::Tool || cache.contains_key(&task.id) {
                continue;
            }
            let ready = task.dependencies.iter().all(|d| {
                matches!(cache.get(d.as_str()), Some(Observation::Completed { .. }))
                    || launch_ids.contains(d.as_str())
            });
            if ready {
                launch_ids.insert(task.id.as_str());
                launch.push(task);
            }
        }
        if launch.is_empty() {
            return Ok(());
        }
        tracing::debug!(session = %self.key, agent = %self.agent, count = launch.len(), "Launching tool batch");

        let mut boards: HashMap<&str, (watch::Sender<Option<Observation>>, watch::Receiver<Option<Observation>>)> =
            launch.iter().map(|t| (t.id.as_str(), watch::channel(None))).collect();
        let values: HashMap<TaskId, Value> = cache
            .iter()
            .filter_map(|(id, o)| o.value().map(|v| (id.clone(), v.clone())))
            .collect();

        let mut jobs = Vec::with_capacity(launch.len());
        for task in &launch {
            let waits: HashMap<TaskId, watch::Receiver<Option<Observation>>> = task
                .dependencies
                .iter()
                .filter_map(|d| boards.get(d.as_str()).map(|(_, rx)| (d.clone(), rx.clone())))
                .collect();
            jobs.push((task, waits));
        }

        let mut set = self.jobs.lock().await;
        for (task, waits) in jobs {
            let Some((tx, _)) = boards.remove(task.id.as_str()) else {
                continue;
            };
            let job = ToolJob {
                key: self.key.clone(),
                task: (*task).clone(),
                tools: Arc::clone(&self.tools),
                scheduler: Arc::clone(&self.scheduler),
                stores: self.stores.clone(),
                observations: Arc::clone(&self.observations),
                dependency_timeout: self.settings.dependency_timeout,
                values: values.clone(),
                waits,
                tx,
                history: state.tool_histories.get(&task.name).cloned().unwrap_or_default(),
            };
            set.spawn(job.run(cancel.clone()));
        }
        drop(boards);

        let join_id = graph
            .terminal()
            .filter(|t| t.is_join() && launch_ids.contains(t.id.as_str()))
            .map(|t| t.id.clone());

        while let Some(joined) = set.join_next().await {
            let finished = match joined {
                Ok(result) => result?,
                Err(e) => {
                    tracing::warn!(session = %self.key, "Tool task aborted: {}", e);
                    continue;
                }
            };
            let Some(finished) = finished else {
                continue;
            };
            record_history(state, &finished);
            if join_id.as_deref() == Some(finished.task_id.as_str()) {
                // 其余工具任务留在集合里继续运行
                if !set.is_empty() {
                    tracing::debug!(session = %self.key, remaining = set.len(), "Join finished before unrelated tool tasks");
                }
                break;
            }
        }
        Ok(())
    }

    async fn join_outcome(&self, graph: &PlanGraph<'_>) -> Option<ExecutionOutcome> {
        let join = graph.terminal().filter(|t| t.is_join())?;
        let observation = self.observation(&join.id).await?;
        Some(outcome_of(&join.id, observation))
    }

    /// 串行处理 Agent 任务：一次至多发起一个委派
    async fn run_agent_tasks(
        &self,
        graph: &PlanGraph<'_>,
        order: &[&Task],
        state: &mut AgentState,
    ) -> Result<AgentStep, StoreError> {
        let mut progressed = false;

        for task in order.iter().copied().filter(|t| t.kind == TaskKind::Agent) {
            let cache = self.snapshot().await;
            if cache.contains_key(&task.id) {
                continue;
            }
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|d| cache.get(d.as_str()).is_some_and(Observation::is_failed))
            {
                self.record(
                    &task.id,
                    Observation::failed(FailureCause::DependencyFailed { task_id: dep.clone() }),
                )
                .await?;
                state.execution.delegated.remove(&task.id);
                progressed = true;
                continue;
            }
            let satisfied = task
                .dependencies
                .iter()
                .all(|d| matches!(cache.get(d.as_str()), Some(Observation::Completed { .. })));
            if !satisfied {
                continue;
            }

            if let Some(result) = state.execution.child_results.remove(&task.id) {
                state.execution.delegated.remove(&task.id);
                let value = fold_child_result(task, result, graph, &cache);
                self.record(&task.id, Observation::completed(value)).await?;
                tracing::info!(session = %self.key, agent = %self.agent, task_id = %task.id, child = %task.name, "Harvested delegated result");
                progressed = true;
                // 下游若是 Agent 任务，按拓扑序在本轮继续处理；工具下游（含 join）在下一轮批次运行
                continue;
            }

            if state.execution.delegated.contains(&task.id) {
                tracing::debug!(session = %self.key, task_id = %task.id, child = %task.name, "Still waiting on delegated task");
                return Ok(AgentStep::Suspend(None));
            }

            let ctx = build_context(task, &cache, Vec::new());
            state.execution.delegated.insert(task.id.clone());
            tracing::info!(session = %self.key, agent = %self.agent, task_id = %task.id, child = %task.name, "Delegating task");
            return Ok(AgentStep::Suspend(Some(Delegation {
                task_id: task.id.clone(),
                agent: task.name.clone(),
                arguments_text: ctx.to_text(),
            })));
        }

        Ok(if progressed {
            AgentStep::Progressed
        } else {
            AgentStep::Idle
        })
    }

    /// 无法继续推进时给出结论
    async fn settle(&self, graph: &PlanGraph<'_>, order: &[&Task], state: &AgentState) -> ExecutionOutcome {
        let cache = self.snapshot().await;

        if order.iter().all(|t| cache.contains_key(&t.id)) {
            return match graph.terminal() {
                Some(terminal) => match cache.get(&terminal.id) {
                    Some(o) => outcome_of(&terminal.id, o.clone()),
                    None => ExecutionOutcome::Completed {
                        task_id: terminal.id.clone(),
                        value: Value::Null,
                    },
                },
                None => ExecutionOutcome::Completed {
                    task_id: TaskId::new(),
                    value: Value::Null,
                },
            };
        }

        if let Some((task, cause)) = order.iter().find_map(|t| match cache.get(&t.id) {
            Some(Observation::Failed { cause }) => Some((t, cause.clone())),
            _ => None,
        }) {
            return ExecutionOutcome::Failed {
                task_id: task.id.clone(),
                cause,
            };
        }

        if !state.execution.delegated.is_empty() {
            return ExecutionOutcome::Suspended(None);
        }

        // 依赖指向既不在计划内、也没有结果的任务
        let blocked = order.iter().find(|t| !cache.contains_key(&t.id));
        match blocked {
            Some(task) => {
                let missing = task
                    .dependencies
                    .iter()
                    .find(|d| !cache.contains_key(d.as_str()))
                    .cloned()
                    .unwrap_or_default();
                tracing::warn!(session = %self.key, task_id = %task.id, dependency = %missing, "Task blocked on unresolvable dependency");
                ExecutionOutcome::Failed {
                    task_id: task.id.clone(),
                    cause: FailureCause::DependencyFailed { task_id: missing },
                }
            }
            None => ExecutionOutcome::Suspended(None),
        }
    }
}

/// 成功的工具调用追加到该工具的私有历史
fn record_history(state: &mut AgentState, finished: &Finished) {
    if let Observation::Completed { value } = &finished.observation {
        state
            .tool_histories
            .entry(finished.tool.clone())
            .or_default()
            .extend([
                Message::user(finished.context_text.clone()),
                Message::assistant(render_value(value)).from_agent(finished.tool.clone()),
            ]);
    }
}

fn outcome_of(task_id: &str, observation: Observation) -> ExecutionOutcome {
    match observation {
        Observation::Completed { value } => ExecutionOutcome::Completed {
            task_id: task_id.to_string(),
            value,
        },
        Observation::Failed { cause } => ExecutionOutcome::Failed {
            task_id: task_id.to_string(),
            cause,
        },
    }
}

/// 子 Agent 结果与工具依赖结果合并：没有工具依赖时即为子 Agent 结果本身
fn fold_child_result(
    task: &Task,
    result: Value,
    graph: &PlanGraph<'_>,
    cache: &HashMap<TaskId, Observation>,
) -> Value {
    let inputs: Map<String, Value> = task
        .dependencies
        .iter()
        .filter(|d| graph.get(d).map_or(true, |t| t.kind == TaskKind::Tool))
        .filter_map(|d| cache.get(d.as_str()).and_then(Observation::value).map(|v| (d.clone(), v.clone())))
        .collect();
    if inputs.is_empty() {
        result
    } else {
        json!({ "result": result, "inputs": inputs })
    }
}

/// `$<id>` 参数替换为被引用任务的结果；找不到时保持原样
fn resolve_arguments(arguments: &[Argument], values: &HashMap<TaskId, Value>) -> Vec<Argument> {
    arguments
        .iter()
        .map(|a| match a.reference().and_then(|id| values.get(id)) {
            Some(v) => Argument::new(a.name.clone(), v.clone()),
            None => a.clone(),
        })
        .collect()
}

fn build_context(task: &Task, cache: &HashMap<TaskId, Observation>, history: Vec<Message>) -> ToolContext {
    let values: HashMap<TaskId, Value> = cache
        .iter()
        .filter_map(|(id, o)| o.value().map(|v| (id.clone(), v.clone())))
        .collect();
    ToolContext {
        task_id: task.id.clone(),
        description: task.description.clone(),
        arguments: resolve_arguments(&task.arguments, &values),
        dependencies: task
            .dependencies
            .iter()
            .filter_map(|d| values.get(d).map(|v| (d.clone(), v.clone())))
            .collect(),
        history,
    }
}

async fn persist_then_cache(
    stores: &Stores,
    key: &SessionKey,
    observations: &SharedObservations,
    task_id: &str,
    observation: &Observation,
) -> Result<(), StoreError> {
    stores
        .save_result(
            key,
            &TaskRecord {
                task_id: task_id.to_string(),
                observation: observation.clone(),
            },
        )
        .await?;
    observations
        .write()
        .await
        .insert(task_id.to_string(), observation.clone());
    Ok(())
}

/// 单个工具任务
struct ToolJob {
    key: SessionKey,
    task: Task,
    tools: Arc<ToolExecutor>,
    scheduler: Arc<TaskScheduler>,
    stores: Stores,
    observations: SharedObservations,
    dependency_timeout: Duration,
    /// 批次开始时已完成任务的结果
    values: HashMap<TaskId, Value>,
    /// 同批次依赖的就绪信号
    waits: HashMap<TaskId, watch::Receiver<Option<Observation>>>,
    tx: watch::Sender<Option<Observation>>,
    history: Vec<Message>,
}

impl ToolJob {
    /// 返回 Ok(None) 表示被取消（不写入任何观测）
    async fn run(mut self, cancel: CancellationToken) -> JobResult {
        let deps = self.task.dependencies.clone();
        for dep in &deps {
            let Some(rx) = self.waits.get_mut(dep) else {
                continue;
            };
            let waited = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                r = timeout(self.dependency_timeout, rx.wait_for(Option::is_some)) => {
                    r.map(|r| r.map(|o| o.clone()))
                }
            };
            let failure = match waited {
                Ok(Ok(Some(Observation::Completed { value }))) => {
                    self.values.insert(dep.clone(), value);
                    None
                }
                Ok(Ok(_)) | Ok(Err(_)) => Some(FailureCause::DependencyFailed { task_id: dep.clone() }),
                Err(_) => Some(FailureCause::Timeout {
                    secs: self.dependency_timeout.as_secs(),
                }),
            };
            if let Some(cause) = failure {
                // 上游因取消退出时通道同样会关闭
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                tracing::warn!(session = %self.key, task_id = %self.task.id, dependency = %dep, %cause, "Tool task not started");
                return self.finish(Observation::failed(cause), String::new()).await;
            }
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            permit = self.scheduler.acquire_tool() => permit,
        };

        let ctx = ToolContext {
            task_id: self.task.id.clone(),
            description: self.task.description.clone(),
            arguments: resolve_arguments(&self.task.arguments, &self.values),
            dependencies: deps
                .iter()
                .filter_map(|d| self.values.get(d).map(|v| (d.clone(), v.clone())))
                .collect(),
            history: std::mem::take(&mut self.history),
        };
        let context_text = ctx.to_text();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            r = self.tools.execute(&self.task.name, &ctx) => r,
        };
        let observation = match result {
            Ok(value) => Observation::completed(value),
            Err(FailureCause::Cancelled) => return Ok(None),
            Err(_) if cancel.is_cancelled() => return Ok(None),
            Err(cause) => {
                tracing::warn!(session = %self.key, task_id = %self.task.id, tool = %self.task.name, %cause, "Tool task failed");
                Observation::failed(cause)
            }
        };
        self.finish(observation, context_text).await
    }

    /// 持久化 → 写缓存 → 发出就绪信号
    async fn finish(self, observation: Observation, context_text: String) -> JobResult {
        persist_then_cache(&self.stores, &self.key, &self.observations, &self.task.id, &observation).await?;
        self.tx.send_replace(Some(observation.clone()));
        Ok(Some(Finished {
            task_id: self.task.id,
            tool: self.task.name,
            context_text,
            observation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{JoinTool, Tool, ToolRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        output: Value,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Counting {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "counts calls"
        }
        async fn execute(&self, _ctx: &ToolContext) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "fails"
        }
        async fn execute(&self, _ctx: &ToolContext) -> Result<Value, String> {
            Err("upstream unavailable".into())
        }
    }

    /// 记录收到的上下文
    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "returns its arguments"
        }
        async fn execute(&self, ctx: &ToolContext) -> Result<Value, String> {
            Ok(json!({ "args": ctx.arguments_json(), "deps": ctx.dependencies.len() }))
        }
    }

    /// 睡一会儿再返回
    struct Slow {
        name: &'static str,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "sleeps before answering"
        }
        async fn execute(&self, _ctx: &ToolContext) -> Result<Value, String> {
            tokio::time::sleep(self.delay).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(format!("{} done", self.name)))
        }
    }

    struct Fixture {
        executor: Executor,
        stores: Stores,
        calls: Arc<AtomicUsize>,
        slow_calls: Arc<AtomicUsize>,
    }

    fn fixture_with(stores: Stores) -> Fixture {
        fixture_with_settings(
            stores,
            ExecutorSettings {
                dependency_timeout: Duration::from_secs(5),
            },
        )
    }

    fn fixture_with_settings(stores: Stores, settings: ExecutorSettings) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Counting {
            name: "hashtags",
            output: json!("#cats #cute"),
            calls: Arc::clone(&calls),
        });
        let slow_calls = Arc::new(AtomicUsize::new(0));
        registry.register(Slow {
            name: "slow",
            delay: Duration::from_millis(400),
            calls: Arc::clone(&slow_calls),
        });
        registry.register(Failing);
        registry.register(Echo);
        registry.register(JoinTool);
        let executor = Executor::new(
            SessionKey::new("client", "chat"),
            "init_agent",
            Arc::new(ToolExecutor::new(registry, 5)),
            Arc::new(TaskScheduler::new(3)),
            stores.clone(),
            SharedObservations::default(),
            settings,
        );
        Fixture {
            executor,
            stores,
            calls,
            slow_calls,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Stores::in_memory())
    }

    #[tokio::test]
    async fn test_join_result_is_formatted_dependency_result() {
        let f = fixture();
        let tasks = vec![Task::tool("1", "hashtags"), Task::join("2").depends_on(["1"])];
        let mut state = AgentState::new("init_agent");

        let outcome = f
            .executor
            .execute_plan(&tasks, &mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ExecutionOutcome::Completed {
                task_id: "2".into(),
                value: json!("#cats #cute")
            }
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.tool_histories["hashtags"].len(), 2);
    }

    #[tokio::test]
    async fn test_agent_task_suspends_with_delegation() {
        let f = fixture();
        let tasks = vec![Task::agent("1", "caption_agent").with_argument("topic", "cats")];
        let mut state = AgentState::new("init_agent");

        let outcome = f
            .executor
            .execute_plan(&tasks, &mut state, &CancellationToken::new())
            .await
            .unwrap();

        let ExecutionOutcome::Suspended(Some(delegation)) = outcome else {
            panic!("expected delegation, got {outcome:?}");
        };
        assert_eq!(delegation.agent, "caption_agent");
        assert_eq!(delegation.task_id, "1");
        assert!(delegation
            .arguments_text
            .starts_with("Use these arguments to process your task: {\"topic\":\"cats\"}"));
        assert!(state.execution.delegated.contains("1"));

        // 再次进入不会重复委派
        let again = f
            .executor
            .execute_plan(&tasks, &mut state, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, ExecutionOutcome::Suspended(None));
    }

    #[tokio::test]
    async fn test_child_result_is_harvested_and_plan_proceeds() {
        let f = fixture();
        let tasks = vec![
            Task::agent("1", "caption_agent"),
            Task::tool("2", "echo").depends_on(["1"]).with_argument("caption", "$1"),
            Task::join("3").depends_on(["2"]),
        ];
        let mut state = AgentState::new("init_agent");
        let cancel = CancellationToken::new();
        f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap();

        state.execution.child_results.insert("1".into(), json!("R"));
        let outcome = f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap();

        assert_eq!(f.executor.observation("1").await, Some(Observation::completed("R")));
        let ExecutionOutcome::Completed { task_id, value } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(task_id, "3");
        assert_eq!(value, json!(r#"{"args":{"caption":"R"},"deps":1}"#));
        assert!(state.execution.delegated.is_empty());
    }

    #[tokio::test]
    async fn test_sole_agent_task_result_is_plan_result() {
        let f = fixture();
        let tasks = vec![Task::agent("1", "caption_agent")];
        let mut state = AgentState::new("init_agent");
        state.execution.delegated.insert("1".into());
        state.execution.child_results.insert("1".into(), json!("R"));

        let outcome = f
            .executor
            .execute_plan(&tasks, &mut state, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Completed {
                task_id: "1".into(),
                value: json!("R")
            }
        );
    }

    #[tokio::test]
    async fn test_child_result_folds_tool_inputs() {
        let f = fixture();
        let tasks = vec![
            Task::tool("1", "hashtags"),
            Task::agent("2", "caption_agent").depends_on(["1"]),
        ];
        let mut state = AgentState::new("init_agent");
        let cancel = CancellationToken::new();
        let first = f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap();
        let ExecutionOutcome::Suspended(Some(d)) = first else {
            panic!("expected delegation");
        };
        assert!(d.arguments_text.contains("1: #cats #cute"));

        state.execution.child_results.insert("2".into(), json!("caption"));
        let outcome = f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Completed {
                task_id: "2".into(),
                value: json!({"result": "caption", "inputs": {"1": "#cats #cute"}})
            }
        );
    }

    #[tokio::test]
    async fn test_restart_does_not_rerun_cached_tool() {
        let stores = Stores::in_memory();
        let key = SessionKey::new("client", "chat");
        stores
            .save_result(
                &key,
                &TaskRecord {
                    task_id: "1".into(),
                    observation: Observation::completed("ok"),
                },
            )
            .await
            .unwrap();

        // 新的执行器 = 空的内存缓存
        let f = fixture_with(stores);
        let tasks = vec![Task::tool("1", "hashtags"), Task::join("2").depends_on(["1"])];
        let mut state = AgentState::new("init_agent");
        let outcome = f
            .executor
            .resume(&tasks, &mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            outcome,
            ExecutionOutcome::Completed {
                task_id: "2".into(),
                value: json!("ok")
            }
        );
    }

    #[tokio::test]
    async fn test_tool_failure_short_circuits_dependents() {
        let f = fixture();
        let tasks = vec![
            Task::tool("1", "broken"),
            Task::tool("2", "hashtags").depends_on(["1"]),
            Task::join("3").depends_on(["2"]),
        ];
        let mut state = AgentState::new("init_agent");

        let outcome = f
            .executor
            .execute_plan(&tasks, &mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            f.executor.observation("2").await,
            Some(Observation::failed(FailureCause::DependencyFailed { task_id: "1".into() }))
        );
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                task_id: "3".into(),
                cause: FailureCause::DependencyFailed { task_id: "2".into() }
            }
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        // 失败也会持久化
        let rows = f.stores.load_results(&SessionKey::new("client", "chat")).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_task() {
        let f = fixture();
        let tasks = vec![Task::tool("1", "nope"), Task::join("2").depends_on(["1"])];
        let mut state = AgentState::new("init_agent");
        f.executor
            .execute_plan(&tasks, &mut state, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            f.executor.observation("1").await,
            Some(Observation::failed(FailureCause::UnknownTarget { name: "nope".into() }))
        );
    }

    #[tokio::test]
    async fn test_each_task_runs_once_per_generation() {
        let f = fixture();
        let tasks = vec![
            Task::tool("1", "hashtags"),
            Task::tool("2", "echo").depends_on(["1"]),
            Task::tool("3", "echo").depends_on(["1"]),
            Task::join("4").depends_on(["2", "3"]),
        ];
        let mut state = AgentState::new("init_agent");
        let cancel = CancellationToken::new();
        f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap();
        f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap();
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        let projection = f.executor.tasks_with_results(&tasks).await;
        assert!(projection.iter().all(|t| t.result.is_some()));
    }

    #[tokio::test]
    async fn test_cancelled_run_writes_nothing() {
        let f = fixture();
        let tasks = vec![Task::tool("1", "hashtags"), Task::join("2").depends_on(["1"])];
        let mut state = AgentState::new("init_agent");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert!(f.executor.observation("1").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_mid_flight_leaves_no_observations() {
        for _ in 0..10 {
            let f = fixture();
            let tasks = vec![
                Task::tool("1", "slow"),
                Task::tool("2", "hashtags").depends_on(["1"]),
                Task::join("3").depends_on(["2"]),
            ];
            let mut state = AgentState::new("init_agent");
            let cancel = CancellationToken::new();
            let trip = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                trip.cancel();
            });

            let err = f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap_err();

            assert!(matches!(err, OrchestratorError::Cancelled));
            for id in ["1", "2", "3"] {
                assert!(f.executor.observation(id).await.is_none(), "task {id} has an observation");
            }
            let rows = f.stores.load_results(&SessionKey::new("client", "chat")).await.unwrap();
            assert!(rows.is_empty());
            assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_dependency_wait_times_out() {
        let f = fixture_with_settings(
            Stores::in_memory(),
            ExecutorSettings {
                dependency_timeout: Duration::from_millis(50),
            },
        );
        let tasks = vec![
            Task::tool("1", "slow"),
            Task::tool("2", "hashtags").depends_on(["1"]),
            Task::join("3").depends_on(["2"]),
        ];
        let mut state = AgentState::new("init_agent");

        let outcome = f
            .executor
            .execute_plan(&tasks, &mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            f.executor.observation("2").await,
            Some(Observation::Failed {
                cause: FailureCause::Timeout { .. }
            })
        ));
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                task_id: "3".into(),
                cause: FailureCause::DependencyFailed { task_id: "2".into() }
            }
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tools_outliving_join_are_collected_next_run() {
        let f = fixture();
        let tasks = vec![
            Task::tool("1", "slow"),
            Task::tool("2", "hashtags"),
            Task::join("3").depends_on(["2"]),
        ];
        let mut state = AgentState::new("init_agent");
        let cancel = CancellationToken::new();

        let outcome = f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Completed { ref task_id, .. } if task_id == "3"));
        // join 不等 slow
        assert!(!state.tool_histories.contains_key("slow"));

        f.executor.execute_plan(&tasks, &mut state, &cancel).await.unwrap();

        assert_eq!(f.slow_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.executor.observation("1").await, Some(Observation::completed("slow done")));
        assert_eq!(state.tool_histories["slow"].len(), 2);
        let rows = f.stores.load_results(&SessionKey::new("client", "chat")).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_resolve_arguments() {
        let values = HashMap::from([("1".to_string(), json!("R"))]);
        let args = vec![Argument::new("a", "$1"), Argument::new("b", "$9"), Argument::new("c", 3)];
        let out = resolve_arguments(&args, &values);
        assert_eq!(out[0].value, json!("R"));
        assert_eq!(out[1].value, json!("$9"));
        assert_eq!(out[2].value, json!(3));
    }
}
