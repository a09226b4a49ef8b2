//! 回调投递
//!
//! 作业进入终态后向调用方提供的 URL POST 一次结果。尽力而为：超时、非 2xx、传输错误
//! 只记日志，不重试，不影响作业状态，也不向后台任务抛错。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CallbackSection;
use crate::core::{DispatchError, ErrorKind, Signer};
use crate::dispatch::job::{Document, Job, JobId, JobMetrics, JobStatus};

/// 回调请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub job_id: JobId,
    pub intent: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub metrics: JobMetrics,
    /// 预留给执行日志，目前总是空
    #[serde(default)]
    pub logs: Vec<String>,
}

impl From<&Job> for CallbackPayload {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id().to_string(),
            intent: job.intent().to_string(),
            status: job.status(),
            result: job.result().cloned(),
            error: job.error().map(|e| e.message.clone()),
            error_kind: job.error().map(|e| e.kind),
            metrics: job.metrics().clone(),
            logs: Vec::new(),
        }
    }
}

pub struct CallbackDispatcher {
    client: reqwest::Client,
    signer: Option<Signer>,
}

impl CallbackDispatcher {
    pub fn new(timeout: Duration, signer: Option<Signer>) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Internal(format!("Failed to build callback client: {}", e)))?;
        Ok(Self { client, signer })
    }

    pub fn from_config(cfg: &CallbackSection) -> Result<Self, DispatchError> {
        Self::new(Duration::from_secs(cfg.timeout_secs), Signer::from_config(cfg))
    }

    /// 投递回调；任何失败只记日志
    pub async fn deliver(&self, url: &str, job: &Job) {
        match self.try_deliver(url, job).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id(), url = %url, "Callback sent");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id(), url = %url, error = %e, "Callback failed");
            }
        }
    }

    pub async fn try_deliver(&self, url: &str, job: &Job) -> Result<(), DispatchError> {
        let body = serde_json::to_vec(&CallbackPayload::from(job))
            .map_err(|e| DispatchError::Internal(format!("Failed to encode callback: {}", e)))?;

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(signer) = &self.signer {
            request = request.header(signer.header(), signer.sign(&body));
        }

        let resp = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout(format!("Callback timed out: {}", e))
            } else {
                DispatchError::Internal(format!("Callback transport error: {}", e))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
