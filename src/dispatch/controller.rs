//! 分发控制器：单一入口 dispatch / get_job / ingest_callback
//!
//! dispatch 流程：
//! 1. 计算幂等键，命中则直接返回已有作业的当前状态
//! 2. 解析模式；只读 / 本地 intent 或显式 agent 模式走快速路径
//! 3. 快速路径：作业进入 Running，在超时内同步等待执行器；超时则把执行句柄交给后台收尾，返回 queued
//! 4. 其余走后台：先预留队列位，再原子占用幂等键，最后入队并返回 queued
//!
//! 快速路径同样先取执行位（有界），取不到返回 Overloaded，不建作业。
//!
//! 快速路径上的 NotFound / Validation 直接返回给调用方，并撤销占位；其他执行器错误记为失败作业。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{DispatchError, ErrorKind, Signer};
use crate::dispatch::callback::CallbackDispatcher;
use crate::dispatch::idempotency::IdempotencyCache;
use crate::dispatch::job::{Document, Job, JobFailure, JobId, JobStatus, JobView, Trace};
use crate::dispatch::mode::{ModeResolver, RequestedMode};
use crate::dispatch::runner::{flatten, JobRunner};
use crate::dispatch::store::{Claim, JobStore};
use crate::dispatch::worker::{QueueSlot, WorkerPool};
use crate::executors::{AgentExecutor, Executor, ExecutorSet, FlowExecutor, ProtocolExecutor};

/// Dispatch 请求
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub intent: String,
    #[serde(default)]
    pub inputs: Document,
    #[serde(default)]
    pub mode: RequestedMode,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub trace: Trace,
}

impl DispatchRequest {
    pub fn new(intent: impl Into<String>, inputs: Document) -> Self {
        Self {
            intent: intent.into(),
            inputs,
            mode: RequestedMode::Auto,
            callback_url: None,
            idempotency_key: None,
            trace: Trace::new(),
        }
    }

    pub fn with_mode(mut self, mode: RequestedMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// 对外状态：Queued 与 Running 都报告为 queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Succeeded,
    Failed,
    Queued,
}

impl From<JobStatus> for ResponseStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Succeeded => ResponseStatus::Succeeded,
            JobStatus::Failed => ResponseStatus::Failed,
            JobStatus::Queued | JobStatus::Running => ResponseStatus::Queued,
        }
    }
}

/// Dispatch 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub job_id: JobId,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub will_callback: bool,
    pub idempotency_key: String,
}

impl DispatchResponse {
    fn from_job(job: &Job, will_callback: bool) -> Self {
        Self {
            job_id: job.id().to_string(),
            status: job.status().into(),
            result: job.result().cloned(),
            error: job.error().map(|e| e.message.clone()),
            error_kind: job.error().map(|e| e.kind),
            will_callback,
            idempotency_key: job.idempotency_key().to_string(),
        }
    }

    /// 幂等命中：回调只会由原请求触发
    fn cached(job: &Job) -> Self {
        let pending_callback = !job.is_terminal() && job.callback_url().is_some();
        Self::from_job(job, pending_callback)
    }
}

/// 回调接收的处理结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAck {
    pub status: String,
    pub job_id: JobId,
    pub job_status: JobStatus,
    /// false 表示作业已是终态，本次回推被忽略
    pub applied: bool,
}

pub struct Dispatcher {
    resolver: ModeResolver,
    cache: IdempotencyCache,
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    workers: Arc<WorkerPool>,
    signer: Option<Signer>,
    sync_timeout: Duration,
    root: CancellationToken,
}

impl Dispatcher {
    /// 按配置组装；需要在 tokio 运行时内调用（会启动后台池）
    pub fn new(
        cfg: &AppConfig,
        store: Arc<dyn JobStore>,
        executors: ExecutorSet,
        root: CancellationToken,
    ) -> Result<Self, DispatchError> {
        let callbacks = Arc::new(CallbackDispatcher::from_config(&cfg.callback)?);
        let runner = Arc::new(JobRunner::new(Arc::clone(&store), executors, callbacks));
        let workers = Arc::new(WorkerPool::start(Arc::clone(&runner), &cfg.dispatch, root.clone()));

        Ok(Self {
            resolver: ModeResolver::from_config(&cfg.routing),
            cache: IdempotencyCache::new(Arc::clone(&store)),
            store,
            runner,
            workers,
            signer: Signer::from_config(&cfg.callback),
            sync_timeout: Duration::from_millis(cfg.dispatch.sync_timeout_ms),
            root,
        })
    }

    /// 使用配置里的三个真实执行器
    pub fn from_config(
        cfg: &AppConfig,
        store: Arc<dyn JobStore>,
        root: CancellationToken,
    ) -> Result<Self, DispatchError> {
        let flow: Arc<dyn Executor> = Arc::new(FlowExecutor::from_config(&cfg.flow)?);
        let protocol: Arc<dyn Executor> = Arc::new(ProtocolExecutor);
        let agent: Arc<dyn Executor> = Arc::new(AgentExecutor::from_config(&cfg.agent));
        Self::new(cfg, store, ExecutorSet::new(flow, protocol, agent), root)
    }

    /// 后台池（注册到关闭协调器）
    pub fn workers(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.workers)
    }

    pub fn signer(&self) -> Option<&Signer> {
        self.signer.as_ref()
    }

    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        if req.intent.trim().is_empty() {
            return Err(DispatchError::Validation("intent must not be empty".to_string()));
        }

        let key = IdempotencyCache::key_for(&req.intent, &req.inputs, req.idempotency_key.as_deref());
        if let Some(existing) = self.cache.lookup(&key).await? {
            tracing::info!(job_id = %existing.id(), key = %short(&key), "Returning cached job");
            return Ok(DispatchResponse::cached(&existing));
        }

        let mode = self.resolver.resolve_requested(req.mode, &req.intent, &req.inputs);
        let fast = self.resolver.is_fast_path(&req.intent) || req.mode == RequestedMode::Agent;

        // 先占执行位或队列位，占不到就不建作业
        let admission = if fast {
            Admission::Inline(self.workers.try_acquire_execution()?)
        } else {
            Admission::Queue(self.workers.reserve()?)
        };

        let mut trace = req.trace;
        if !trace.contains_key("request_id") {
            trace.insert("request_id".to_string(), Value::String(new_request_id()));
        }
        let job = Job::new(req.intent, mode, req.inputs, key, req.callback_url, trace);

        let job = match self.cache.record(job).await? {
            Claim::Existing(existing) => {
                tracing::info!(job_id = %existing.id(), "Concurrent duplicate, returning existing job");
                return Ok(DispatchResponse::cached(&existing));
            }
            Claim::Created(job) => job,
        };

        match admission {
            Admission::Queue(slot) => {
                tracing::info!(job_id = %job.id(), intent = %job.intent(), mode = %mode, "Job queued");
                let will_callback = job.callback_url().is_some();
                let response = DispatchResponse::from_job(&job, will_callback);
                slot.send(job);
                Ok(response)
            }
            Admission::Inline(permit) => self.fast_path(job, permit).await,
        }
    }

    async fn fast_path(&self, job: Job, permit: OwnedSemaphorePermit) -> Result<DispatchResponse, DispatchError> {
        let Some(running) = self.runner.begin(&job).await? else {
            return Ok(DispatchResponse::cached(&self.current(job).await?));
        };

        let mut handle = self.runner.spawn_execution(&running, permit);
        match tokio::time::timeout(self.sync_timeout, &mut handle).await {
            Ok(joined) => {
                let (result, latency) = flatten(joined);
                if let Err(e) = &result {
                    if e.is_client_facing() {
                        self.cache.forget(running.idempotency_key(), running.id()).await?;
                        return Err(e.clone());
                    }
                }
                let done = self.runner.finalize(running, result, latency, false).await?;
                Ok(DispatchResponse::from_job(&done, false))
            }
            Err(_) => {
                tracing::info!(
                    job_id = %running.id(),
                    timeout_ms = self.sync_timeout.as_millis() as u64,
                    "Sync timeout, switching to background"
                );
                let will_callback = running.callback_url().is_some();
                let response = DispatchResponse::from_job(&running, will_callback);
                self.runner.adopt(running, handle, self.root.child_token());
                Ok(response)
            }
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobView, DispatchError> {
        self.store
            .get(job_id)
            .await?
            .map(|job| JobView::from(&job))
            .ok_or_else(|| DispatchError::NotFound(format!("Job {} not found", job_id)))
    }

    /// 外部系统（工作流引擎等）回推作业结果
    pub async fn ingest_callback(&self, payload: Value) -> Result<IngestAck, DispatchError> {
        let update = ExternalUpdate::parse(&payload)?;

        // 与本地执行并发时可能 CAS 失败，重读后再试
        for _ in 0..3 {
            let Some(current) = self.store.get(&update.job_id).await? else {
                let mut job = Job::external(update.job_id.clone(), update.intent.clone());
                update.apply(&mut job)?;
                match self.store.insert_if_absent(job).await? {
                    Claim::Created(job) => return Ok(self.ack(&job, true)),
                    Claim::Existing(_) => continue,
                }
            };

            if current.is_terminal() {
                tracing::info!(job_id = %current.id(), "Ignoring callback for finished job");
                return Ok(self.ack(&current, false));
            }

            let mut next = current.clone();
            update.apply(&mut next)?;
            if next == current {
                return Ok(self.ack(&current, false));
            }
            if self.store.compare_and_swap(current.status(), next.clone()).await? {
                return Ok(self.ack(&next, true));
            }
        }
        Err(DispatchError::Internal(format!(
            "job {} is being updated concurrently",
            update.job_id
        )))
    }

    fn ack(&self, job: &Job, applied: bool) -> IngestAck {
        tracing::info!(job_id = %job.id(), status = job.status().as_str(), applied, "Callback ingested");
        IngestAck {
            status: "ok".to_string(),
            job_id: job.id().to_string(),
            job_status: job.status(),
            applied,
        }
    }

    async fn current(&self, job: Job) -> Result<Job, DispatchError> {
        Ok(self.store.get(job.id()).await?.unwrap_or(job))
    }
}

/// 请求占到的容量
enum Admission {
    Inline(OwnedSemaphorePermit),
    Queue(QueueSlot),
}

/// 回推内容
struct ExternalUpdate {
    job_id: JobId,
    intent: String,
    status: JobStatus,
    result: Document,
    error: String,
}

impl ExternalUpdate {
    fn parse(payload: &Value) -> Result<Self, DispatchError> {
        let obj = payload
            .as_object()
            .ok_or_else(|| DispatchError::Validation("payload must be a JSON object".to_string()))?;
        let job_id = obj
            .get("job_id")
            .or_else(|| obj.get("jobId"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DispatchError::Validation("Missing job_id in payload".to_string()))?;

        let status = match obj.get("status").and_then(Value::as_str) {
            None => JobStatus::Succeeded,
            Some(s) => JobStatus::parse(s)
                .ok_or_else(|| DispatchError::Validation(format!("Unknown status: {}", s)))?,
        };

        // 没有 result 字段时，除控制字段外的整个 payload 作为结果
        let result = match obj.get("result") {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut doc = Document::new();
                doc.insert("value".to_string(), other.clone());
                doc
            }
            None => obj
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "job_id" | "jobId" | "status" | "error" | "intent"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        let error = match obj.get("error") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "external job failed".to_string(),
            Some(other) => other.to_string(),
        };

        Ok(Self {
            job_id: job_id.to_string(),
            intent: obj
                .get("intent")
                .and_then(Value::as_str)
                .unwrap_or("external")
                .to_string(),
            status,
            result,
            error,
        })
    }

    fn apply(&self, job: &mut Job) -> Result<(), DispatchError> {
        match self.status {
            JobStatus::Queued => Ok(()),
            JobStatus::Running if job.status() == JobStatus::Queued => job.start(),
            JobStatus::Running => Ok(()),
            JobStatus::Succeeded => job.finish(Ok(self.result.clone()), None),
            JobStatus::Failed => job.fail_with(JobFailure::upstream(self.error.clone())),
        }
    }
}

fn new_request_id() -> String {
    format!("req_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// 日志里只打印键的前 8 位
fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}
