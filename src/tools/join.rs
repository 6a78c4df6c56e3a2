//! join：计划的终结工具
//!
//! 默认实现不调用补全服务，按依赖顺序每行输出一个依赖结果。

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolContext};
use crate::workflow::{render_value, JOIN_TOOL};

#[derive(Debug, Default)]
pub struct JoinTool;

#[async_trait]
impl Tool for JoinTool {
    fn name(&self) -> &str {
        JOIN_TOOL
    }

    fn description(&self) -> &str {
        "Final step of every plan. Collects the results of the tasks it depends on into the answer for the user."
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<Value, String> {
        let lines: Vec<String> = ctx
            .dependencies
            .iter()
            .map(|(_, value)| render_value(value))
            .collect();
        Ok(Value::String(lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_join_renders_one_line_per_dependency() {
        let ctx = ToolContext {
            dependencies: vec![("1".into(), json!("#cats #cute")), ("2".into(), json!({"k": 1}))],
            ..ToolContext::default()
        };
        let out = JoinTool.execute(&ctx).await.unwrap();
        assert_eq!(out, json!("#cats #cute\n{\"k\":1}"));
    }

    #[tokio::test]
    async fn test_join_single_dependency_is_identity() {
        let ctx = ToolContext {
            dependencies: vec![("1".into(), json!("tags"))],
            ..ToolContext::default()
        };
        assert_eq!(JoinTool.execute(&ctx).await.unwrap(), json!("tags"));
    }
}
