//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时并把失败统一转为 FailureCause。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::memory::Message;
use crate::workflow::{render_value, Argument, TaskId};

/// 依赖结果段落的标题（历史投影据此识别内部上下文消息）
pub const DEPENDENCY_RESULTS_HEADER: &str = "Here are the results of the tasks that you depend on:";

/// 一次工具 / 委派调用的上下文：已解析 `$<id>` 引用的参数与依赖结果
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub task_id: TaskId,
    pub description: String,
    pub arguments: Vec<Argument>,
    /// 按依赖声明顺序
    pub dependencies: Vec<(TaskId, Value)>,
    /// 工具在当前 Agent 下的私有历史
    pub history: Vec<Message>,
}

impl ToolContext {
    /// 参数按名组成 JSON 对象
    pub fn arguments_json(&self) -> Value {
        let map: Map<String, Value> = self
            .arguments
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect();
        Value::Object(map)
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.iter().find(|a| a.name == name).map(|a| &a.value)
    }

    /// 送给工具或子 Agent 的上下文文本
    pub fn to_text(&self) -> String {
        let mut text = format!(
            "Use these arguments to process your task: {}",
            self.arguments_json()
        );
        if !self.dependencies.is_empty() {
            text.push_str("\n\n");
            text.push_str(DEPENDENCY_RESULTS_HEADER);
            for (id, value) in &self.dependencies {
                text.push_str(&format!("\n{}: {}", id, render_value(value)));
            }
        }
        text
    }
}

/// 工具 trait：名称、描述（供 Planner 理解）、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划中任务的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（写入 Planner 的 system prompt）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Tool registered twice; keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// (name, description) 列表（按名排序），用于生成 Planner 的可用动作段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        out.sort();
        out
    }
}
