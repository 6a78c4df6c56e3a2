//! OpenAI 兼容 API 补全服务
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；需要结构化输出时使用 json_schema 响应格式，
//! 返回后再按 OutputSchema 本地校验一次。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{Completion, CompletionError, CompletionService, OutputSchema};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let p = self.prompt_tokens.load(Ordering::Relaxed);
        let c = self.completion_tokens.load(Ordering::Relaxed);
        (p, c, p + c)
    }
}

pub struct OpenAiCompletion {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    pub usage: TokenUsage,
}

impl OpenAiCompletion {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, timeout_secs: u64) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            usage: TokenUsage::default(),
        }
    }

    fn to_openai_messages(
        &self,
        history: &[Message],
        system_prompt: &str,
        message: &str,
    ) -> Result<Vec<ChatCompletionRequestMessage>, CompletionError> {
        let err = |e: async_openai::error::OpenAIError| CompletionError::Request(e.to_string());
        let mut out = Vec::with_capacity(history.len() + 2);
        if !system_prompt.is_empty() {
            out.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt)
                    .build()
                    .map_err(err)?
                    .into(),
            );
        }
        for m in history {
            let msg: ChatCompletionRequestMessage = match m.role {
                Role::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(err)?
                    .into(),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(err)?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(err)?
                    .into(),
            };
            out.push(msg);
        }
        if !message.is_empty() {
            out.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(message)
                    .build()
                    .map_err(err)?
                    .into(),
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(
        &self,
        history: &[Message],
        system_prompt: &str,
        message: &str,
        schema: Option<&OutputSchema>,
    ) -> Result<Completion, CompletionError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(self.to_openai_messages(history, system_prompt, message)?);
        if let Some(schema) = schema {
            args.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: schema.name.clone(),
                    schema: Some(schema.to_json_schema()),
                    strict: Some(false),
                },
            });
        }
        let request = args
            .build()
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| CompletionError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        match schema {
            None => Ok(Completion::Text(content)),
            Some(schema) => {
                let value = Completion::Text(content).into_structured()?;
                schema.validate(&value)?;
                Ok(Completion::Structured(value))
            }
        }
    }
}
