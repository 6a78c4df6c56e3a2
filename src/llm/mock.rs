//! Mock 补全服务（无需 API）
//!
//! - MockCompletion：回显用户消息，便于本地跑通控制台流程
//! - ScriptedCompletion：按队列返回预置结果并记录每次请求，用于测试

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{Completion, CompletionError, CompletionService, OutputSchema};
use crate::memory::Message;

/// 回显客户端：结构化请求只返回 message 字段
#[derive(Debug, Default)]
pub struct MockCompletion;

#[async_trait]
impl CompletionService for MockCompletion {
    async fn complete(
        &self,
        _history: &[Message],
        _system_prompt: &str,
        message: &str,
        schema: Option<&OutputSchema>,
    ) -> Result<Completion, CompletionError> {
        let text = format!("Echo from Mock: {}", message);
        Ok(match schema {
            Some(_) => Completion::Structured(json!({ "message": text })),
            None => Completion::Text(text),
        })
    }
}

/// 一次被记录的请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub system_prompt: String,
    pub message: String,
    pub schema: Option<String>,
    pub history_len: usize,
}

/// 脚本化补全：依次弹出预置结果；结构化结果会按请求的 schema 校验
#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    script: Mutex<VecDeque<Result<Completion, CompletionError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push(Ok(Completion::Text(text.into())))
    }

    pub fn push_structured(&self, value: Value) -> &Self {
        self.push(Ok(Completion::Structured(value)))
    }

    pub fn push_error(&self, error: CompletionError) -> &Self {
        self.push(Err(error))
    }

    fn push(&self, item: Result<Completion, CompletionError>) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        history: &[Message],
        system_prompt: &str,
        message: &str,
        schema: Option<&OutputSchema>,
    ) -> Result<Completion, CompletionError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                system_prompt: system_prompt.to_string(),
                message: message.to_string(),
                schema: schema.map(|s| s.name.clone()),
                history_len: history.len(),
            });
        }

        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| Err(CompletionError::Request("script exhausted".into())));

        match (next?, schema) {
            (Completion::Structured(v), Some(schema)) => {
                schema.validate(&v)?;
                Ok(Completion::Structured(v))
            }
            (other, _) => Ok(other),
        }
    }
}
