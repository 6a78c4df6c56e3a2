//! Agent 配置档案：名称、描述、需求字段、可用工具与可委派的子 Agent
//!
//! 从 `[[agents]]` 配置段反序列化，或在代码中用 builder 方法构造。

use serde::Deserialize;

use crate::llm::{FieldType, OutputSchema, SchemaField};

const DEFAULT_PROMPT: &str = "You collect the user's requirements for the task. Ask short clarifying \
questions until the requirements are clear, then fill in the requirements object. \
When a plan has been presented, set plan_approved only if the user explicitly agrees to it.";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    /// 写入父 Agent 的 Planner 动作列表
    #[serde(default)]
    pub description: String,
    /// 需求轮的 system prompt
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// 需求对象的字段
    #[serde(default)]
    pub requirements: Vec<SchemaField>,
    /// Planner 示例（原样拼入 system prompt）
    #[serde(default)]
    pub planner_examples: String,
    /// 可用工具；为空表示注册表中的全部工具
    #[serde(default)]
    pub tools: Vec<String>,
    /// 可委派的子 Agent
    #[serde(default)]
    pub delegates: Vec<String>,
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

impl AgentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            prompt: default_prompt(),
            requirements: Vec::new(),
            planner_examples: String::new(),
            tools: Vec::new(),
            delegates: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn requirement(mut self, field: SchemaField) -> Self {
        self.requirements.push(field);
        self
    }

    pub fn with_examples(mut self, examples: impl Into<String>) -> Self {
        self.planner_examples = examples.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delegates<I, S>(mut self, delegates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delegates = delegates.into_iter().map(Into::into).collect();
        self
    }

    /// 需求轮的结构化输出
    ///
    /// plan_approved 只在已有计划时出现；result_accepted / changes_to_apply 只在等待验收时出现。
    pub fn turn_schema(&self, has_plan: bool, awaiting_approval: bool) -> OutputSchema {
        let mut schema = OutputSchema::new(format!("{}_turn", self.name))
            .field(
                SchemaField::new("message", FieldType::String)
                    .describe("Your reply to the user")
                    .required(),
            )
            .field(
                SchemaField::new(
                    "requirements",
                    FieldType::Object {
                        fields: self.requirements.clone(),
                    },
                )
                .describe("Fill in only once the user's requirements are clear; otherwise leave it null"),
            );
        if has_plan {
            schema = schema.field(
                SchemaField::new("plan_approved", FieldType::Boolean).describe(
                    "True only if the user explicitly confirms the plan as is. False if the user asks \
questions or wants to adjust the plan.",
                ),
            );
        }
        if awaiting_approval {
            schema = schema
                .field(
                    SchemaField::new("result_accepted", FieldType::Boolean)
                        .describe("True only if the user explicitly accepts the delivered result."),
                )
                .field(
                    SchemaField::new("changes_to_apply", FieldType::String)
                        .describe("Changes the user wants applied to the result; empty if accepted."),
                );
        }
        schema
    }
}
