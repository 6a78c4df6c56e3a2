//! WebSocket 网关：把客户端帧翻译为 Mediator 调用，并把会话事件转发回客户端

mod hub;
mod protocol;

pub use hub::{Hub, HubConfig};
pub use protocol::{InboundCommand, InboundFrame, OutboundFrame};
