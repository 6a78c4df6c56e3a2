//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, ctx) 在超时内调用工具，
//! 未注册 / 超时 / 失败分别转为 FailureCause（UnknownTarget / Timeout / ToolError）；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::tools::{ToolContext, ToolRegistry};
use crate::workflow::FailureCause;

/// 工具执行器：对每次调用施加超时，并将结果映射为 FailureCause
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub async fn execute(&self, tool_name: &str, ctx: &ToolContext) -> Result<Value, FailureCause> {
        let Some(tool) = self.registry.get(tool_name) else {
            audit(tool_name, &ctx.task_id, false, "unknown", 0, ctx);
            return Err(FailureCause::UnknownTarget {
                name: tool_name.to_string(),
            });
        };

        let start = Instant::now();
        let result = timeout(self.timeout, tool.execute(ctx)).await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        audit(tool_name, &ctx.task_id, outcome == "ok", outcome, duration_ms, ctx);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(FailureCause::ToolError { message }),
            Err(_) => Err(FailureCause::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn audit(tool: &str, task_id: &str, ok: bool, outcome: &str, duration_ms: u64, ctx: &ToolContext) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "task_id": task_id,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview(&ctx.arguments_json()),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
