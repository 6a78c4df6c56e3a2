//! 记忆层：对话消息与上下文窗口

pub mod conversation;

pub use conversation::{recent_window, Message, Role};
