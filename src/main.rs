//! Hive - 多智能体任务编排引擎
//!
//! 入口：初始化日志、构建 Mediator，在终端中驱动一个会话。
//! 输入普通文本发送消息；/history、/delete <内容>、/stack、/cancel、/quit 为控制命令。

use anyhow::Context;
use hive::core::build_mediator;
use hive::mediator::EventKind;
use hive::store::SessionKey;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let mediator = build_mediator(config_path)
        .await
        .context("Failed to build mediator")?;

    let chat_id = std::env::var("HIVE_CHAT_ID").unwrap_or_else(|_| "console".to_string());
    let key = SessionKey::new("console", chat_id);

    // 事件输出
    let mut events = mediator.subscribe();
    let printer_key = key.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.session != printer_key {
                continue;
            }
            match event.kind {
                EventKind::Message => println!("\n{}\n", event.text()),
                EventKind::PlanningStarted => println!("[planning...]"),
                EventKind::ExecutionStarted => println!("[executing...]"),
                EventKind::Plan => println!(
                    "[plan]\n{}",
                    serde_json::to_string_pretty(&event.content).unwrap_or_default()
                ),
                EventKind::Error | EventKind::ValidationError => {
                    eprintln!("[{:?}] {}", event.kind, event.text())
                }
                EventKind::MessageDeleted | EventKind::History => println!("[{:?}] {}", event.kind, event.text()),
            }
        }
    });

    println!("Hive console. Session: {}. Type /quit to exit.", key);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/cancel" => mediator.cancel(&key).await,
            "/stack" => match mediator.call_stack(&key).await {
                Ok(stack) => println!("[stack] {}", stack.join(" > ")),
                Err(e) => eprintln!("[error] {}", e),
            },
            "/history" => match mediator.history(&key).await {
                Ok(history) => {
                    for m in history {
                        let who = m.agent.as_deref().unwrap_or("user");
                        println!("{} [{}] {}", m.created_at.format("%H:%M:%S"), who, m.content);
                    }
                }
                Err(e) => eprintln!("[error] {}", e),
            },
            _ => {
                if let Some(content) = line.strip_prefix("/delete ") {
                    if let Err(e) = mediator.delete_message(&key, content).await {
                        eprintln!("[error] {}", e);
                    }
                    continue;
                }
                // 后台处理，便于随时 /cancel
                let mediator = mediator.clone();
                let key = key.clone();
                let text = line.to_string();
                tokio::spawn(async move {
                    if let Err(e) = mediator.handle_message(&key, &text).await {
                        tracing::debug!(error = %e, "Message handling ended with error");
                    }
                });
            }
        }
    }

    Ok(())
}
