//! 作业记录与状态机
//!
//! 状态只能前进：Queued → Running → Succeeded | Failed；终态不再变化。
//! 结果与错误放在同一个 JobOutcome 里，二者天然互斥。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{DispatchError, ErrorKind};
use crate::dispatch::mode::Mode;

/// 结构化键值文档（inputs / result 的通用表示，不做编译期 schema 约束）
pub type Document = serde_json::Map<String, Value>;

/// 追踪上下文（request_id、job_id、上游关联 id），只透传，不参与控制决策
pub type Trace = Document;

pub type JobId = String;

/// 作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// 失败信息：分类 + 原样保留的错误文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    /// 外部系统回推的失败：文本原样保留
    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::UpstreamError,
            message: message.into(),
        }
    }
}

impl From<&DispatchError> for JobFailure {
    fn from(e: &DispatchError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// 终态结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { result: Document },
    Failed { error: JobFailure },
}

/// 执行指标
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    /// 执行器调用的墙钟耗时
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// 作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    intent: String,
    mode: Mode,
    status: JobStatus,
    inputs: Document,
    outcome: Option<JobOutcome>,
    idempotency_key: String,
    callback_url: Option<String>,
    trace: Trace,
    /// 毫秒时间戳
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    metrics: JobMetrics,
}

pub fn new_job_id() -> JobId {
    format!("job_{}", uuid::Uuid::new_v4().simple())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Job {
    /// 新作业，初始状态 Queued；trace 中补上 job_id
    pub fn new(
        intent: impl Into<String>,
        mode: Mode,
        inputs: Document,
        idempotency_key: impl Into<String>,
        callback_url: Option<String>,
        mut trace: Trace,
    ) -> Self {
        let id = new_job_id();
        trace.insert("job_id".to_string(), Value::String(id.clone()));
        Self {
            id,
            intent: intent.into(),
            mode,
            status: JobStatus::Queued,
            inputs,
            outcome: None,
            idempotency_key: idempotency_key.into(),
            callback_url,
            trace,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            metrics: JobMetrics::default(),
        }
    }

    /// 外部系统回推、本地没有记录的作业（id 由外部给出）
    pub fn external(id: impl Into<JobId>, intent: impl Into<String>) -> Self {
        let id = id.into();
        let mut trace = Trace::new();
        trace.insert("job_id".to_string(), Value::String(id.clone()));
        Self {
            idempotency_key: format!("ingest:{}", id),
            id,
            intent: intent.into(),
            mode: Mode::Flow,
            status: JobStatus::Queued,
            inputs: Document::new(),
            outcome: None,
            callback_url: None,
            trace,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            metrics: JobMetrics::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn inputs(&self) -> &Document {
        &self.inputs
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn callback_url(&self) -> Option<&str> {
        self.callback_url.as_deref()
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn started_at(&self) -> Option<i64> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<i64> {
        self.completed_at
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.metrics
    }

    pub fn result(&self) -> Option<&Document> {
        match &self.outcome {
            Some(JobOutcome::Succeeded { result }) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JobFailure> {
        match &self.outcome {
            Some(JobOutcome::Failed { error }) => Some(error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued → Running
    pub fn start(&mut self) -> Result<(), DispatchError> {
        if self.status != JobStatus::Queued {
            return Err(self.illegal(JobStatus::Running));
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now_ms());
        Ok(())
    }

    /// Running（或 Queued，视为瞬时经过 Running）→ 终态
    pub fn finish(
        &mut self,
        outcome: Result<Document, DispatchError>,
        latency_ms: Option<u64>,
    ) -> Result<(), DispatchError> {
        let outcome = match outcome {
            Ok(result) => JobOutcome::Succeeded { result },
            Err(e) => JobOutcome::Failed { error: JobFailure::from(&e) },
        };
        self.complete(outcome, latency_ms)
    }

    /// 直接以给定失败信息结束（不经过 DispatchError 的格式化）
    pub fn fail_with(&mut self, failure: JobFailure) -> Result<(), DispatchError> {
        self.complete(JobOutcome::Failed { error: failure }, None)
    }

    fn complete(&mut self, outcome: JobOutcome, latency_ms: Option<u64>) -> Result<(), DispatchError> {
        let next = match outcome {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        };
        if self.is_terminal() {
            return Err(self.illegal(next));
        }
        let now = now_ms();
        self.started_at.get_or_insert(now);
        self.completed_at = Some(now);
        self.metrics.latency_ms = latency_ms;
        self.status = next;
        self.outcome = Some(outcome);
        Ok(())
    }

    fn illegal(&self, next: JobStatus) -> DispatchError {
        DispatchError::Internal(format!(
            "illegal transition for {}: {} -> {}",
            self.id,
            self.status.as_str(),
            next.as_str()
        ))
    }
}

/// GetJob 的对外视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub intent: String,
    pub mode: Mode,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub metrics: JobMetrics,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            intent: job.intent.clone(),
            mode: job.mode,
            status: job.status,
            result: job.result().cloned(),
            error: job.error().map(|e| e.message.clone()),
            error_kind: job.error().map(|e| e.kind),
            metrics: job.metrics.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}
