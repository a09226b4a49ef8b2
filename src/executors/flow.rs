//! Flow 执行器：把 intent 投递到外部工作流引擎的 Webhook
//!
//! 请求体 `{intent, inputs, trace}`，响应 JSON 对象原样作为作业结果。
//! 没有专门路由的 intent 走兜底 Webhook。
//! 错误映射：传输超时 → Timeout；非 2xx → Upstream(status, body)；其他传输错误 → Internal。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::FlowSection;
use crate::core::DispatchError;
use crate::dispatch::job::{Document, Trace};
use crate::dispatch::mode::Mode;
use crate::executors::Executor;

#[derive(Serialize)]
struct FlowRequest<'a> {
    intent: &'a str,
    inputs: &'a Document,
    trace: &'a Trace,
}

pub struct FlowExecutor {
    client: reqwest::Client,
    webhook_base: String,
    routes: HashMap<String, String>,
    fallback_path: String,
}

impl FlowExecutor {
    pub fn new(
        webhook_base: impl Into<String>,
        routes: HashMap<String, String>,
        fallback_path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Internal(format!("Failed to build flow client: {}", e)))?;
        Ok(Self {
            client,
            webhook_base: webhook_base.into(),
            routes,
            fallback_path: fallback_path.into(),
        })
    }

    pub fn from_config(cfg: &FlowSection) -> Result<Self, DispatchError> {
        Self::new(
            cfg.webhook_base.clone(),
            cfg.routes.clone(),
            cfg.fallback_path.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    /// intent 对应的 Webhook URL；路由值可以是完整 URL，也可以是相对 base 的路径
    pub fn endpoint_for(&self, intent: &str) -> String {
        let target = self
            .routes
            .get(intent)
            .map(String::as_str)
            .unwrap_or(self.fallback_path.as_str());
        if target.starts_with("http://") || target.starts_with("https://") {
            return target.to_string();
        }
        format!(
            "{}/{}",
            self.webhook_base.trim_end_matches('/'),
            target.trim_start_matches('/')
        )
    }
}

fn transport_error(e: reqwest::Error) -> DispatchError {
    if e.is_timeout() {
        DispatchError::Timeout(format!("Flow execution timed out: {}", e))
    } else {
        DispatchError::Internal(format!("Flow execution failed: {}", e))
    }
}

#[async_trait]
impl Executor for FlowExecutor {
    fn mode(&self) -> Mode {
        Mode::Flow
    }

    async fn execute(&self, intent: &str, inputs: &Document, trace: &Trace) -> Result<Document, DispatchError> {
        let url = self.endpoint_for(intent);
        tracing::info!(intent = %intent, url = %url, "Executing flow");

        let resp = self
            .client
            .post(&url)
            .json(&FlowRequest { intent, inputs, trace })
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(intent = %intent, status = status.as_u16(), "Flow HTTP error");
            return Err(DispatchError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = resp.json().await.map_err(transport_error)?;
        Ok(match value {
            Value::Object(map) => map,
            // 非对象响应包一层，保证结果仍是文档
            other => {
                let mut doc = Document::new();
                doc.insert("value".to_string(), other);
                doc
            }
        })
    }
}
