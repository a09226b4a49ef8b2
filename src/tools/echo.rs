//! Echo 工具（联调用）

use async_trait::async_trait;
use serde_json::Value;

use crate::dispatch::job::Document;
use crate::tools::Tool;

/// 回显 text 字段
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "debug.echo"
    }

    fn description(&self) -> &str {
        "Echo text (for testing). Args: {\"text\": \"message\"}"
    }

    async fn execute(&self, args: &Document) -> Result<Document, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        let mut out = Document::new();
        out.insert("text".to_string(), Value::String(text.to_string()));
        Ok(out)
    }
}
