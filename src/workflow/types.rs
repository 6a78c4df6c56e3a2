//! 计划类型定义
//!
//! 任务（Tool / Agent 两类）、参数、计划代次、观测结果与失败原因。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type TaskId = String;

/// 终结任务（join）的工具名
pub const JOIN_TOOL: &str = "join";

/// 任务类型：在规划时根据注册表解析，执行时不再按名字猜测
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Tool,
    Agent,
}

/// 任务参数（有序）；值为 `$<id>` 形式时引用该任务的观测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: Value,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// 若值为 `$<id>` 引用，返回被引用的任务 id
    pub fn reference(&self) -> Option<&str> {
        self.value
            .as_str()
            .and_then(|s| s.strip_prefix('$'))
            .filter(|id| !id.is_empty())
    }
}

/// 计划中的一个节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// 工具名或 Agent 名
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<Argument>,
    /// 依赖的任务 id（保序去重）
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub description: String,
    /// 执行器写入的结果（每代计划至多写入一次）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Observation>,
}

impl Task {
    pub fn tool(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TaskKind::Tool,
            name: name.into(),
            arguments: Vec::new(),
            dependencies: Vec::new(),
            description: String::new(),
            result: None,
        }
    }

    pub fn agent(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Agent,
            ..Self::tool(id, name)
        }
    }

    pub fn join(id: impl Into<TaskId>) -> Self {
        Self::tool(id, JOIN_TOOL)
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.push(Argument::new(name, value));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_join(&self) -> bool {
        self.kind == TaskKind::Tool && self.name == JOIN_TOOL
    }

    /// 除结果与 id 外内容是否一致（重规划时判断任务是否被修改）
    pub fn same_work(&self, other: &Task) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.arguments == other.arguments
            && self.dependencies == other.dependencies
    }
}

/// 计划模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Fresh,
    ReplanBeforeExecution,
    ReplanAfterExecution,
}

/// 一次 Planner 调用产生的一代计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    pub mode: PlanMode,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(tasks: Vec<Task>, overview: Option<String>, mode: PlanMode) -> Self {
        Self {
            tasks,
            overview,
            mode,
            created_at: Utc::now(),
        }
    }

    pub fn join_task(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.is_join())
    }
}

/// 任务失败原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    #[error("tool error: {message}")]
    ToolError { message: String },

    /// 任务引用了未注册的工具或 Agent（配置错误，不重试）
    #[error("unknown tool or agent: {name}")]
    UnknownTarget { name: String },

    #[error("dependency {task_id} failed")]
    DependencyFailed { task_id: TaskId },

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// 会话被取消；不会写入观测缓存
    #[error("cancelled")]
    Cancelled,
}

/// 任务观测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Observation {
    Completed { value: Value },
    Failed { cause: FailureCause },
}

impl Observation {
    pub fn completed(value: impl Into<Value>) -> Self {
        Observation::Completed {
            value: value.into(),
        }
    }

    pub fn failed(cause: FailureCause) -> Self {
        Observation::Failed { cause }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Observation::Completed { value } => Some(value),
            Observation::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Observation::Failed { .. })
    }
}

/// 观测缓存中的一条记录（TaskResultStore 的行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub observation: Observation,
}

/// tasks_with_results 投影：重规划时提供给 Planner 的执行上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWithResult {
    pub task: Task,
    pub result: Option<Observation>,
}

/// 计划校验错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Duplicate task id: {0}")]
    DuplicateId(TaskId),

    #[error("Task {task_id} depends on unknown task {dependency}")]
    DanglingDependency { task_id: TaskId, dependency: TaskId },

    #[error("Dependency cycle involving task {0}")]
    Cycle(TaskId),

    #[error("Malformed plan: {0}")]
    Malformed(String),
}

/// 结果值转为文本：字符串原样输出，其余输出紧凑 JSON
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
