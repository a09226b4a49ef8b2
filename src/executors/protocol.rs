//! Protocol 执行器（工具发现协议适配，尚未接入）
//!
//! 返回带 `unimplemented` 标记的结果文档，保证分发层处理方式与其他执行器一致。

use async_trait::async_trait;
use serde_json::Value;

use crate::core::DispatchError;
use crate::dispatch::job::{Document, Trace};
use crate::dispatch::mode::Mode;
use crate::executors::Executor;

#[derive(Debug, Default)]
pub struct ProtocolExecutor;

#[async_trait]
impl Executor for ProtocolExecutor {
    fn mode(&self) -> Mode {
        Mode::Protocol
    }

    async fn execute(&self, intent: &str, inputs: &Document, trace: &Trace) -> Result<Document, DispatchError> {
        tracing::warn!(intent = %intent, "Protocol path not implemented, returning marker result");
        let mut result = Document::new();
        result.insert("unimplemented".to_string(), Value::Bool(true));
        result.insert(
            "note".to_string(),
            Value::String("Protocol adapter stubbed - not yet implemented".to_string()),
        );
        result.insert("intent".to_string(), Value::String(intent.to_string()));
        result.insert("inputs".to_string(), Value::Object(inputs.clone()));
        result.insert("trace".to_string(), Value::Object(trace.clone()));
        Ok(result)
    }
}
