//! 单元测试共用的假执行器与本地 HTTP 服务

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::DispatchError;
use crate::dispatch::job::{Document, Trace};
use crate::dispatch::mode::Mode;
use crate::executors::{Executor, ExecutorSet};

pub fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap_or_default()
}

/// 在 127.0.0.1 随机端口上启动 axum 服务，返回监听地址
#[cfg(feature = "server")]
pub async fn spawn_http(router: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// 固定返回值的执行器，可设置延迟并统计调用次数
pub struct FakeExecutor {
    mode: Mode,
    delay: Duration,
    outcome: Result<Document, DispatchError>,
    calls: Arc<AtomicUsize>,
}

impl FakeExecutor {
    pub fn ok(mode: Mode, result: Value) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            outcome: Ok(doc(result)),
            calls: Arc::default(),
        }
    }

    pub fn failing(mode: Mode, err: DispatchError) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            outcome: Err(err),
            calls: Arc::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn mode(&self) -> Mode {
        self.mode
    }

    async fn execute(&self, _intent: &str, _inputs: &Document, _trace: &Trace) -> Result<Document, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}

/// 三个模式都用同一个执行器
pub fn uniform_set(executor: FakeExecutor) -> ExecutorSet {
    let shared: Arc<dyn Executor> = Arc::new(executor);
    ExecutorSet::new(Arc::clone(&shared), Arc::clone(&shared), shared)
}
