//! 网关消息协议
//!
//! 入站：`{type, content?, chatId, clientId?}`，type ∈ message / get_history / delete_message / cancel；
//! 出站：`{type, content, chatId}`，type 与 EventKind 一致。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mediator::{EventKind, OutboundEvent};

/// 入站命令
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundCommand {
    Message {
        content: String,
        #[serde(rename = "chatId", alias = "chat_id")]
        chat_id: String,
    },
    GetHistory {
        #[serde(rename = "chatId", alias = "chat_id")]
        chat_id: String,
    },
    DeleteMessage {
        content: String,
        #[serde(rename = "chatId", alias = "chat_id")]
        chat_id: String,
    },
    Cancel {
        #[serde(rename = "chatId", alias = "chat_id")]
        chat_id: String,
    },
}

impl InboundCommand {
    pub fn chat_id(&self) -> &str {
        match self {
            InboundCommand::Message { chat_id, .. }
            | InboundCommand::GetHistory { chat_id }
            | InboundCommand::DeleteMessage { chat_id, .. }
            | InboundCommand::Cancel { chat_id } => chat_id,
        }
    }
}

/// 入站帧；clientId 只在连接的第一帧生效，缺省时使用连接 id
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundFrame {
    #[serde(flatten)]
    pub command: InboundCommand,
    #[serde(default, rename = "clientId", alias = "client_id")]
    pub client_id: Option<String>,
}

/// 出站帧
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: Value,
    #[serde(rename = "chatId", skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl OutboundFrame {
    pub fn new(kind: EventKind, content: impl Into<Value>, chat_id: Option<&str>) -> Self {
        Self {
            kind,
            content: content.into(),
            chat_id: chat_id.map(String::from),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, Value::String(message.into()), None)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<&OutboundEvent> for OutboundFrame {
    fn from(event: &OutboundEvent) -> Self {
        Self::new(event.kind, event.content.clone(), Some(&event.session.chat_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionKey;
    use serde_json::json;

    #[test]
    fn test_parse_inbound() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"message","content":"hi","chatId":"c1","clientId":"alice"}"#).unwrap();
        assert_eq!(
            frame.command,
            InboundCommand::Message {
                content: "hi".into(),
                chat_id: "c1".into()
            }
        );
        assert_eq!(frame.client_id.as_deref(), Some("alice"));

        let frame: InboundFrame = serde_json::from_str(r#"{"type":"cancel","chat_id":"c2"}"#).unwrap();
        assert_eq!(frame.command.chat_id(), "c2");
        assert!(frame.client_id.is_none());

        assert!(serde_json::from_str::<InboundFrame>(r#"{"type":"auth","chatId":"c"}"#).is_err());
    }

    #[test]
    fn test_outbound_from_event() {
        let event = OutboundEvent {
            session: SessionKey::new("alice", "c1"),
            kind: EventKind::ValidationError,
            content: json!("bad output"),
        };
        let value: Value = serde_json::from_str(&OutboundFrame::from(&event).to_json()).unwrap();
        assert_eq!(
            value,
            json!({"type": "validation_error", "content": "bad output", "chatId": "c1"})
        );
    }
}
