//! 由补全服务驱动的工具
//!
//! CompletionTool：以固定 system prompt 处理上下文文本（如生成标题、话题标签）；
//! CompletionJoinTool：用补全服务把依赖结果整理成面向用户的最终答复。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::CompletionService;
use crate::tools::{Tool, ToolContext};
use crate::workflow::JOIN_TOOL;

const JOINER_PROMPT: &str = "You are the final step of a plan. You receive the original task \
description and the results of every task it depended on. Combine them into one clear answer \
for the user without inventing facts that are not in the results. \
End your answer with: Do you like the result or want to change something?";

pub struct CompletionTool {
    name: String,
    description: String,
    system_prompt: String,
    service: Arc<dyn CompletionService>,
}

impl CompletionTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
        service: Arc<dyn CompletionService>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            service,
        }
    }
}

#[async_trait]
impl Tool for CompletionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<Value, String> {
        self.service
            .complete(&ctx.history, &self.system_prompt, &ctx.to_text(), None)
            .await
            .map(|c| Value::String(c.text()))
            .map_err(|e| e.to_string())
    }
}

/// 以补全服务实现的 join
pub struct CompletionJoinTool {
    service: Arc<dyn CompletionService>,
}

impl CompletionJoinTool {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Tool for CompletionJoinTool {
    fn name(&self) -> &str {
        JOIN_TOOL
    }

    fn description(&self) -> &str {
        "Final step of every plan. Summarises the results of the tasks it depends on for the user."
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<Value, String> {
        let mut message = String::new();
        if !ctx.description.is_empty() {
            message.push_str(&format!("Task: {}\n", ctx.description));
        }
        message.push_str(&ctx.to_text());
        self.service
            .complete(&[], JOINER_PROMPT, &message, None)
            .await
            .map(|c| Value::String(c.text()))
            .map_err(|e| e.to_string())
    }
}
