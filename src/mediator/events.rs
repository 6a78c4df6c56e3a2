//! 出站事件
//!
//! Agent 与 Mediator 通过 EventSink 广播事件，网关 / 控制台订阅后按会话过滤再转发。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::core::OrchestratorError;
use crate::store::SessionKey;

/// 出站事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    PlanningStarted,
    ExecutionStarted,
    /// 合并后的计划视图
    Plan,
    History,
    MessageDeleted,
    Error,
    /// 结构化输出校验失败
    ValidationError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    #[serde(skip)]
    pub session: SessionKey,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: Value,
}

impl OutboundEvent {
    /// 文本内容（非字符串内容输出 JSON）
    pub fn text(&self) -> String {
        crate::workflow::render_value(&self.content)
    }
}

#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<OutboundEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.tx.subscribe()
    }

    /// 没有订阅者时事件直接丢弃
    pub fn emit(&self, session: &SessionKey, kind: EventKind, content: impl Into<Value>) {
        let _ = self.tx.send(OutboundEvent {
            session: session.clone(),
            kind,
            content: content.into(),
        });
    }

    pub fn message(&self, session: &SessionKey, text: impl Into<String>) {
        self.emit(session, EventKind::Message, Value::String(text.into()));
    }

    /// 错误分类：结构化输出校验失败单独上报
    pub fn error(&self, session: &SessionKey, err: &OrchestratorError) {
        let kind = if err.is_validation() {
            EventKind::ValidationError
        } else {
            EventKind::Error
        };
        self.emit(session, kind, Value::String(err.to_string()));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
