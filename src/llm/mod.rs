//! 补全层：服务抽象与实现（OpenAI 兼容 / Mock / 脚本化）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockCompletion, RecordedRequest, ScriptedCompletion};
pub use openai::{OpenAiCompletion, TokenUsage};
pub use traits::{Completion, CompletionError, CompletionService, FieldType, OutputSchema, SchemaField};

use crate::memory::{recent_window, Message};

/// 带历史的一轮补全：只发送最近 max_turns 轮，成功后把本轮 user / assistant 消息追加进 history
pub async fn converse(
    service: &dyn CompletionService,
    history: &mut Vec<Message>,
    agent: &str,
    system_prompt: &str,
    message: &str,
    schema: Option<&OutputSchema>,
    max_turns: usize,
) -> Result<Completion, CompletionError> {
    let completion = service
        .complete(recent_window(history, max_turns), system_prompt, message, schema)
        .await?;
    if !message.is_empty() {
        history.push(Message::user(message));
    }
    history.push(Message::assistant(completion.text()).from_agent(agent));
    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_converse_appends_turn() {
        let service = ScriptedCompletion::new();
        service.push_text("hello back");
        let mut history = vec![Message::user("old"), Message::assistant("older")];

        let out = converse(&service, &mut history, "init_agent", "sys", "hello", None, 1)
            .await
            .unwrap();

        assert_eq!(out.text(), "hello back");
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].agent.as_deref(), Some("init_agent"));
        assert_eq!(service.requests()[0].history_len, 2);
    }

    #[tokio::test]
    async fn test_converse_failure_leaves_history() {
        let service = ScriptedCompletion::new();
        let mut history = Vec::new();
        assert!(converse(&service, &mut history, "a", "", "x", None, 5).await.is_err());
        assert!(history.is_empty());
    }
}
