//! 执行器适配层
//!
//! 三种可互换的后端都实现 Executor：FlowExecutor（工作流引擎 Webhook）、
//! ProtocolExecutor（工具发现协议，占位实现）、AgentExecutor（进程内注册工具）。
//! 统一契约：execute(intent, inputs, trace) → 结果文档，或带分类的 DispatchError。

pub mod agent;
pub mod flow;
pub mod protocol;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::core::DispatchError;
use crate::dispatch::job::{Document, Trace};
use crate::dispatch::mode::Mode;

pub use agent::AgentExecutor;
pub use flow::FlowExecutor;
pub use protocol::ProtocolExecutor;

/// 执行器 trait
#[async_trait]
pub trait Executor: Send + Sync {
    fn mode(&self) -> Mode;

    async fn execute(&self, intent: &str, inputs: &Document, trace: &Trace)
        -> Result<Document, DispatchError>;
}

/// 按模式持有三个执行器
#[derive(Clone)]
pub struct ExecutorSet {
    flow: Arc<dyn Executor>,
    protocol: Arc<dyn Executor>,
    agent: Arc<dyn Executor>,
}

impl ExecutorSet {
    pub fn new(flow: Arc<dyn Executor>, protocol: Arc<dyn Executor>, agent: Arc<dyn Executor>) -> Self {
        Self { flow, protocol, agent }
    }

    pub fn get(&self, mode: Mode) -> Arc<dyn Executor> {
        match mode {
            Mode::Flow => Arc::clone(&self.flow),
            Mode::Protocol => Arc::clone(&self.protocol),
            Mode::Agent => Arc::clone(&self.agent),
        }
    }

    /// 调用执行器并输出审计日志；返回结果与耗时（毫秒）
    pub async fn run(
        &self,
        mode: Mode,
        intent: &str,
        inputs: &Document,
        trace: &Trace,
    ) -> (Result<Document, DispatchError>, u64) {
        let executor = self.get(mode);
        let start = Instant::now();
        let result = executor.execute(intent, inputs, trace).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        let request_id = trace.get("request_id").and_then(|v| v.as_str()).unwrap_or("-");
        tracing::info!(
            intent = %intent,
            mode = %mode,
            outcome,
            duration_ms,
            request_id,
            "executor audit"
        );
        (result, duration_ms)
    }
}
