//! Agent 执行器：按 intent 调用进程内注册的工具
//!
//! 未注册 → NotFound；工具返回 Err → Internal。
//! 破坏性 intent 在 inputs 未带确认标记时不执行，返回 dry-run 结果（安全闸门，不是错误）。

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::AgentSection;
use crate::core::DispatchError;
use crate::dispatch::job::{Document, Trace};
use crate::dispatch::mode::Mode;
use crate::executors::Executor;
use crate::tools::{builtin_registry, ToolRegistry};

pub struct AgentExecutor {
    registry: ToolRegistry,
    confirm_flag: String,
    destructive_intents: HashSet<String>,
}

impl AgentExecutor {
    pub fn new(
        registry: ToolRegistry,
        confirm_flag: impl Into<String>,
        destructive_intents: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            registry,
            confirm_flag: confirm_flag.into(),
            destructive_intents: destructive_intents.into_iter().collect(),
        }
    }

    /// 内置工具 + 配置中的安全闸门
    pub fn from_config(cfg: &AgentSection) -> Self {
        Self::new(
            builtin_registry(cfg),
            cfg.confirm_flag.clone(),
            cfg.destructive_intents.iter().cloned(),
        )
    }

    /// 确认标记接受布尔 true 或字符串 "true"
    fn is_confirmed(&self, inputs: &Document) -> bool {
        match inputs.get(&self.confirm_flag) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    fn dry_run(&self, intent: &str, description: &str, inputs: &Document) -> Document {
        let out = json!({
            "dry_run": true,
            "executed": false,
            "intent": intent,
            "description": description,
            "would_execute": inputs,
            "note": format!("Set {}=true to execute", self.confirm_flag),
            "hint": "Destructive operation. Review the inputs above before confirming.",
        });
        out.as_object().cloned().unwrap_or_default()
    }
}

fn args_preview(args: &Document) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[async_trait]
impl Executor for AgentExecutor {
    fn mode(&self) -> Mode {
        Mode::Agent
    }

    async fn execute(&self, intent: &str, inputs: &Document, _trace: &Trace) -> Result<Document, DispatchError> {
        let Some(tool) = self.registry.get(intent) else {
            return Err(DispatchError::NotFound(format!(
                "Intent '{}' not found. Available: [{}]",
                intent,
                self.registry.intents().join(", ")
            )));
        };

        let destructive = tool.destructive() || self.destructive_intents.contains(intent);
        if destructive && !self.is_confirmed(inputs) {
            tracing::warn!(intent = %intent, "Destructive intent without confirmation, dry run only");
            return Ok(self.dry_run(intent, tool.description(), inputs));
        }

        tracing::debug!(intent = %intent, args = %args_preview(inputs), "agent tool call");
        tool.execute(inputs)
            .await
            .map_err(|e| DispatchError::Internal(format!("Agent execution failed: {}", e)))
    }
}
