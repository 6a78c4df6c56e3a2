//! Planner：把需求对象转成任务 DAG
//!
//! 补全服务返回 `{tasks, overview}`；本地解析任务类型、分配 id 并校验依赖图。
//! 重规划时 id 契约在本地强制（见 workflow::ids），不依赖补全服务遵守。

use std::collections::HashSet;
use std::sync::Arc;

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::OrchestratorError;
use crate::llm::{converse, CompletionError, CompletionService, FieldType, OutputSchema, SchemaField};
use crate::memory::Message;
use crate::workflow::{
    assign_fresh_ids, enforce_replan_contract, Argument, Plan, PlanGraph, PlanMode, Task, TaskId,
    TaskIdAllocator, TaskKind, TaskWithResult, JOIN_TOOL,
};

const PLANNER_PROMPT: &str = "Given the user requirements, create a plan that solves them with the utmost \
parallelism. Each task of the plan must use one of the following {count} actions:
{actions}

Guidelines:
 - Each task MUST have a unique 8-digit id.
 - Inputs of a task are either constants or outputs of preceding tasks. Use $id to refer to the output of \
task id, and list that task in dependencies.
 - Maximize parallelism.
 - When the results of several tasks must be combined for the user, end the plan with a single join task \
that depends on them.
 - Only use the provided actions. Never introduce new ones.";

const JOIN_DESCRIPTION: &str = "Collects the results of the tasks it depends on into the final answer. \
Always the last task when it is used.";

/// 补全服务返回的计划
#[derive(Debug, Deserialize, JsonSchema)]
struct WirePlan {
    tasks: Vec<WireTask>,
    /// 以 "I will..." 开头的简短说明，结尾询问用户是否同意
    #[serde(default)]
    overview: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WireTask {
    /// 唯一的 8 位数字 id
    id: WireId,
    /// 动作名：工具、子 Agent 或 join
    tool: String,
    #[serde(default)]
    arguments: Vec<WireArgument>,
    /// 依赖任务的 id
    #[serde(default)]
    dependencies: Vec<WireId>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(u64),
}

impl WireId {
    fn into_id(self) -> TaskId {
        match self {
            WireId::Text(s) => s.trim().to_string(),
            WireId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WireArgument {
    name: String,
    value: Value,
}

/// 一个可用动作
#[derive(Debug, Clone)]
pub struct PlanAction {
    pub name: String,
    pub description: String,
    pub kind: TaskKind,
}

/// 本次规划的上下文
pub struct PlanContext<'a> {
    /// 上一代计划及其结果（执行后重规划时提供）
    pub previous: &'a [TaskWithResult],
    pub executed_requirements: Option<&'a Value>,
    /// 会话内已占用的 id
    pub allocator: &'a mut TaskIdAllocator,
    /// 计划外可被依赖的任务（会话内已有结果的任务）
    pub external: &'a HashSet<TaskId>,
}

pub struct Planner {
    completion: Arc<dyn CompletionService>,
    actions: Vec<PlanAction>,
    examples: String,
    max_turns: usize,
}

impl Planner {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        actions: Vec<PlanAction>,
        examples: impl Into<String>,
        max_turns: usize,
    ) -> Self {
        Self {
            completion,
            actions,
            examples: examples.into(),
            max_turns,
        }
    }

    pub fn system_prompt(&self) -> String {
        let mut lines: Vec<String> = self
            .actions
            .iter()
            .filter(|a| a.name != JOIN_TOOL)
            .enumerate()
            .map(|(i, a)| format!("{}. {}: {}", i + 1, a.name, a.description))
            .collect();
        lines.push(format!("{}. {}: {}", lines.len() + 1, JOIN_TOOL, JOIN_DESCRIPTION));

        let mut prompt = PLANNER_PROMPT
            .replace("{count}", &lines.len().to_string())
            .replace("{actions}", &lines.join("\n"));
        if !self.examples.trim().is_empty() {
            prompt.push_str("\n\nAn example of a correct answer:\n");
            prompt.push_str(self.examples.trim());
        }
        prompt
    }

    pub fn output_schema() -> OutputSchema {
        let schema = SchemaSettings::draft07()
            .with(|s| s.inline_subschemas = true)
            .into_generator()
            .into_root_schema_for::<WirePlan>();
        let tasks = serde_json::to_value(&schema)
            .ok()
            .and_then(|v| v.pointer("/properties/tasks").cloned())
            .unwrap_or_else(|| serde_json::json!({"type": "array"}));

        OutputSchema::new("plan")
            .field(
                SchemaField::new("tasks", FieldType::Json { schema: tasks })
                    .describe("The tasks of the plan")
                    .required(),
            )
            .field(SchemaField::new("overview", FieldType::String).describe(
                "A short summary of the planned steps starting with 'I will...', addressed to the user, \
ending by asking for approval or changes",
            ))
    }

    fn kind_of(&self, name: &str) -> TaskKind {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.kind)
            .unwrap_or(TaskKind::Tool)
    }

    fn user_message(requirements: &Value, mode: PlanMode, ctx: &PlanContext<'_>) -> String {
        let requirements = serde_json::to_string_pretty(requirements).unwrap_or_default();
        match mode {
            PlanMode::Fresh => format!("Generate a plan based on user requirements:\n{requirements}"),
            PlanMode::ReplanBeforeExecution => {
                format!("Re-plan based on new requirements:\n{requirements}")
            }
            PlanMode::ReplanAfterExecution => {
                let executed = ctx
                    .executed_requirements
                    .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
                    .unwrap_or_else(|| "null".to_string());
                let previous = serde_json::to_string_pretty(ctx.previous).unwrap_or_default();
                format!(
                    "Re-plan based on new requirements:\n{requirements}\n\n\
Requirements of the executed plan:\n{executed}\n\n\
Executed tasks with their results:\n{previous}\n\n\
Keep the id of every task that the change does not affect. Give a new id to every task that changes \
and to every task that depends on a changed task."
                )
            }
        }
    }

    /// 生成一代计划；history 为 Planner 自己的对话历史
    pub async fn create_plan(
        &self,
        history: &mut Vec<Message>,
        requirements: &Value,
        mode: PlanMode,
        ctx: PlanContext<'_>,
    ) -> Result<Plan, OrchestratorError> {
        let schema = Self::output_schema();
        let message = Self::user_message(requirements, mode, &ctx);
        let completion = converse(
            self.completion.as_ref(),
            history,
            "planner",
            &self.system_prompt(),
            &message,
            Some(&schema),
            self.max_turns,
        )
        .await?;

        let wire: WirePlan = serde_json::from_value(completion.into_structured()?)
            .map_err(|e| CompletionError::SchemaValidation(format!("plan: {e}")))?;

        let mut tasks: Vec<Task> = wire
            .tasks
            .into_iter()
            .map(|t| {
                let mut task = Task {
                    id: t.id.into_id(),
                    kind: self.kind_of(&t.tool),
                    name: t.tool,
                    arguments: t
                        .arguments
                        .into_iter()
                        .map(|a| Argument::new(a.name, a.value))
                        .collect(),
                    dependencies: Vec::new(),
                    description: t.description,
                    result: None,
                };
                task = task.depends_on(t.dependencies.into_iter().map(WireId::into_id));
                task
            })
            .collect();

        let report = match mode {
            PlanMode::ReplanAfterExecution => {
                enforce_replan_contract(&mut tasks, ctx.previous, ctx.allocator)?
            }
            PlanMode::Fresh | PlanMode::ReplanBeforeExecution => assign_fresh_ids(&mut tasks, ctx.allocator),
        };
        if !report.reassigned.is_empty() {
            tracing::info!(
                reassigned = report.reassigned.len(),
                kept = report.kept.len(),
                "Planner output violated the id contract; ids reassigned"
            );
        }

        PlanGraph::new(&tasks).validate(|id| ctx.external.contains(id))?;
        tracing::info!(tasks = tasks.len(), mode = ?mode, "Plan created");
        Ok(Plan::new(tasks, wire.overview, mode))
    }
}
