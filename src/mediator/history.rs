//! 会话历史投影
//!
//! 合并会话内所有 Agent 的对话历史（按时间排序），去掉 system 消息、空的结构化消息
//! 以及委派时发给子 Agent 的内部上下文。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::agent::AgentState;
use crate::memory::{Message, Role};
use crate::tools::DEPENDENCY_RESULTS_HEADER;

const DELEGATION_PREFIX: &str = "Use these arguments to process your task:";

fn task_list_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)\[\s*\{.*?\}\s*\]").ok())
        .as_ref()
}

/// 内容是否为空的结构化消息（`{}` 或 message 字段为空）
fn is_empty_structured(content: &str) -> bool {
    match serde_json::from_str::<Value>(content.trim()) {
        Ok(Value::Object(map)) => map
            .get("message")
            .map_or(map.is_empty(), |m| m.as_str().map_or(true, |s| s.trim().is_empty())),
        _ => false,
    }
}

/// 是否应出现在对外历史中
pub fn is_visible(message: &Message) -> bool {
    if message.role == Role::System {
        return false;
    }
    let content = message.content.trim();
    if content.is_empty() || is_empty_structured(content) {
        return false;
    }
    if content.starts_with(DELEGATION_PREFIX) || content.contains(DEPENDENCY_RESULTS_HEADER) {
        return false;
    }
    !task_list_pattern().is_some_and(|re| re.is_match(content))
}

/// 合并后的可见历史，按时间排序（同一时刻保持 Agent 内顺序）
pub fn project(states: &[AgentState]) -> Vec<Message> {
    let mut merged: Vec<Message> = states
        .iter()
        .flat_map(|s| s.conversation_history.iter())
        .filter(|m| is_visible(m))
        .cloned()
        .collect();
    merged.sort_by_key(|m| m.created_at);
    merged
}

/// 删除内容相同的消息，返回删除条数
pub fn remove_matching(history: &mut Vec<Message>, content: &str) -> usize {
    let before = history.len();
    history.retain(|m| m.content != content);
    before - history.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn at(mut message: Message, offset_secs: i64) -> Message {
        message.created_at = Utc::now() + Duration::seconds(offset_secs);
        message
    }

    #[test]
    fn test_internal_messages_are_hidden() {
        assert!(!is_visible(&Message::system("prompt")));
        assert!(!is_visible(&Message::assistant("{}")));
        assert!(!is_visible(&Message::assistant(r#"{"message": ""}"#)));
        assert!(!is_visible(&Message::user(
            "Use these arguments to process your task: {}"
        )));
        assert!(!is_visible(&Message::user(format!(
            "x\n\n{DEPENDENCY_RESULTS_HEADER}\n1: a"
        ))));
        assert!(!is_visible(&Message::assistant(r#"[ {"id": "1", "tool": "join"} ]"#)));
        assert!(is_visible(&Message::assistant("Here is your caption")));
        assert!(is_visible(&Message::assistant(r#"{"message": "hi"}"#)));
    }

    #[test]
    fn test_project_merges_in_time_order() {
        let mut root = AgentState::new("init_agent");
        root.conversation_history = vec![at(Message::user("first"), 0), at(Message::assistant("third"), 20)];
        let mut child = AgentState::new("caption_agent");
        child.conversation_history = vec![
            at(Message::user("Use these arguments to process your task: {}"), 5),
            at(Message::assistant("second"), 10),
        ];

        let history = project(&[root, child]);
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_remove_matching() {
        let mut history = vec![Message::user("x"), Message::assistant("y"), Message::user("x")];
        assert_eq!(remove_matching(&mut history, "x"), 2);
        assert_eq!(remove_matching(&mut history, "x"), 0);
        assert_eq!(history.len(), 1);
    }
}
