//! Hive Gateway - WebSocket 服务器
//!
//! 运行方式：
//! ```bash
//! cargo run --bin hive-gateway --features gateway
//! ```

use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{MediatorBuilder, ShutdownManager};
use hive::gateway::{Hub, HubConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });

    let bind_addr = std::env::var("GATEWAY_BIND").unwrap_or_else(|_| cfg.gateway.bind_addr.clone());

    let mediator = MediatorBuilder::new(cfg)
        .build()
        .await
        .context("Failed to build mediator")?;

    let hub = Hub::new(HubConfig { bind_addr }, mediator);
    let addr = hub
        .start()
        .await
        .map_err(anyhow::Error::msg)
        .context("Failed to start gateway")?;

    tracing::info!("Hive gateway ready on ws://{}", addr);
    tracing::info!("Press Ctrl+C to stop");

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut reason = shutdown.subscribe();
    shutdown.wait_for_shutdown().await;

    tracing::info!(reason = ?reason.try_recv().ok(), "Shutting down gateway...");
    hub.stop();

    Ok(())
}
