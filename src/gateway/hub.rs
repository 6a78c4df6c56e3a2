//! WebSocket 网关
//!
//! 每个连接一个读循环；出站消息经 mpsc 交给写任务。Mediator 的广播事件按 client_id 过滤后转发，
//! 用户消息在独立任务中处理，读循环因此能及时收到 cancel。

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::protocol::{InboundCommand, InboundFrame, OutboundFrame};
use crate::mediator::{EventKind, Mediator};
use crate::store::SessionKey;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// WebSocket 监听地址
    pub bind_addr: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
        }
    }
}

pub struct Hub {
    config: HubConfig,
    mediator: Mediator,
    shutdown: watch::Sender<bool>,
}

impl Hub {
    pub fn new(config: HubConfig, mediator: Mediator) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            mediator,
            shutdown,
        }
    }

    /// 绑定端口并在后台接受连接，返回实际监听地址
    pub async fn start(&self) -> Result<SocketAddr, String> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address: {}", e))?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind: {}", e))?;
        let local = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local address: {}", e))?;

        tracing::info!("Gateway listening on ws://{}", local);

        let mut shutdown_rx = self.shutdown.subscribe();
        let mediator = self.mediator.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let mediator = mediator.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, mediator).await {
                                        tracing::error!("Connection error from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
            tracing::info!("Gateway accept loop stopped");
        });

        Ok(local)
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// 把属于 client_id 的广播事件转发给连接
fn spawn_event_forwarder(
    mut events: broadcast::Receiver<crate::mediator::OutboundEvent>,
    client_id: String,
    tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.session.client_id == client_id => {
                    if tx.send(OutboundFrame::from(&event).to_json()).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(client = %client_id, skipped = n, "Event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, mediator: Mediator) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let connection_id = format!("ws_{}", uuid::Uuid::new_v4());
    let mut client_id: Option<String> = None;
    let mut forwarder: Option<JoinHandle<()>> = None;

    tracing::info!("New WebSocket connection from {}", addr);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => {
                let frame: InboundFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = tx.send(OutboundFrame::error(format!("parse_error: {}", e)).to_json());
                        continue;
                    }
                };

                let client = client_id
                    .get_or_insert_with(|| frame.client_id.clone().unwrap_or_else(|| connection_id.clone()))
                    .clone();
                if forwarder.is_none() {
                    forwarder = Some(spawn_event_forwarder(mediator.subscribe(), client.clone(), tx.clone()));
                }

                let key = SessionKey::new(client, frame.command.chat_id());
                dispatch(&mediator, key, frame.command, &tx).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    if let Some(f) = forwarder {
        f.abort();
    }
    writer.abort();
    tracing::info!("WebSocket connection closed: {}", addr);
    Ok(())
}

async fn dispatch(mediator: &Mediator, key: SessionKey, command: InboundCommand, tx: &mpsc::UnboundedSender<String>) {
    match command {
        InboundCommand::Message { content, .. } => {
            let mediator = mediator.clone();
            tokio::spawn(async move {
                // 错误已由会话 worker 作为 error / validation_error 事件广播
                if let Err(e) = mediator.handle_message(&key, &content).await {
                    tracing::debug!(session = %key, error = %e, "Message handling ended with error");
                }
            });
        }
        InboundCommand::Cancel { .. } => {
            mediator.cancel(&key).await;
        }
        InboundCommand::GetHistory { chat_id } => {
            let frame = match mediator.history(&key).await {
                Ok(history) => OutboundFrame::new(
                    EventKind::History,
                    serde_json::to_value(history).unwrap_or(Value::Null),
                    Some(&chat_id),
                ),
                Err(e) => OutboundFrame::new(EventKind::Error, Value::String(e.to_string()), Some(&chat_id)),
            };
            let _ = tx.send(frame.to_json());
        }
        InboundCommand::DeleteMessage { content, chat_id } => {
            // 成功时 message_deleted 经广播送达
            if let Err(e) = mediator.delete_message(&key, &content).await {
                let frame = OutboundFrame::new(EventKind::Error, Value::String(e.to_string()), Some(&chat_id));
                let _ = tx.send(frame.to_json());
            }
        }
    }
}
