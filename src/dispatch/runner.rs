//! 作业执行与状态推进
//!
//! 每个作业同一时刻只有一个写者：后台 worker、快速路径的同步等待，或接手超时快速路径的收尾任务。
//! 状态写入都走存储的 compare_and_swap，预期状态不符（例如外部回调已先完成该作业）时放弃写入。

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::DispatchError;
use crate::dispatch::callback::CallbackDispatcher;
use crate::dispatch::job::{Document, Job, JobStatus};
use crate::dispatch::store::JobStore;
use crate::executors::ExecutorSet;

/// 执行器调用结果与耗时（毫秒）
pub type Execution = (Result<Document, DispatchError>, u64);

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    executors: ExecutorSet,
    callbacks: Arc<CallbackDispatcher>,
    tracker: TaskTracker,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, executors: ExecutorSet, callbacks: Arc<CallbackDispatcher>) -> Self {
        Self {
            store,
            executors,
            callbacks,
            tracker: TaskTracker::new(),
        }
    }

    /// 所有后台任务（作业、收尾、回调）都登记在这里，关闭时统一等待
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Queued → Running；作业已被别人推进时返回 None
    pub async fn begin(&self, job: &Job) -> Result<Option<Job>, DispatchError> {
        let mut running = job.clone();
        running.start()?;
        if self.store.compare_and_swap(JobStatus::Queued, running.clone()).await? {
            Ok(Some(running))
        } else {
            tracing::warn!(job_id = %job.id(), "Job is no longer queued, skipping");
            Ok(None)
        }
    }

    /// 后台执行一个 Queued 作业直到终态；token 取消时记为失败
    pub async fn run(&self, job: Job, token: CancellationToken) -> Result<Job, DispatchError> {
        let Some(running) = self.begin(&job).await? else {
            return self.current(job).await;
        };
        tracing::info!(job_id = %running.id(), intent = %running.intent(), mode = %running.mode(), "Job started");

        let (result, latency) = tokio::select! {
            biased;
            _ = token.cancelled() => (Err(shutting_down()), None),
            (result, ms) = self.executors.run(
                running.mode(),
                running.intent(),
                running.inputs(),
                running.trace(),
            ) => (result, Some(ms)),
        };
        self.finalize(running, result, latency, true).await
    }

    /// 在独立任务里调用执行器（快速路径用，超时后句柄交给 adopt）
    ///
    /// permit 随任务持有到执行器返回，调用方不再等待后仍计入并发上限。
    pub fn spawn_execution(&self, job: &Job, permit: OwnedSemaphorePermit) -> JoinHandle<Execution> {
        let executors = self.executors.clone();
        let mode = job.mode();
        let intent = job.intent().to_string();
        let inputs = job.inputs().clone();
        let trace = job.trace().clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            executors.run(mode, &intent, &inputs, &trace).await
        })
    }

    /// 接手一个已在运行、但调用方不再等待的执行：不取消、不重跑，只负责收尾
    pub fn adopt(self: &Arc<Self>, job: Job, mut handle: JoinHandle<Execution>, token: CancellationToken) {
        let runner = Arc::clone(self);
        self.tracker.spawn(async move {
            let joined = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                joined = &mut handle => Some(joined),
            };
            let (result, latency) = match joined {
                Some(joined) => flatten(joined),
                None => {
                    handle.abort();
                    (Err(shutting_down()), None)
                }
            };
            if let Err(e) = runner.finalize(job, result, latency, true).await {
                tracing::error!(error = %e, "Failed to finalize adopted job");
            }
        });
    }

    /// Running → 终态；notify 为真且有回调地址时投递回调
    pub async fn finalize(
        &self,
        mut job: Job,
        result: Result<Document, DispatchError>,
        latency_ms: Option<u64>,
        notify: bool,
    ) -> Result<Job, DispatchError> {
        job.finish(result, latency_ms)?;
        if !self.store.compare_and_swap(JobStatus::Running, job.clone()).await? {
            return match self.store.get(job.id()).await? {
                Some(current) => {
                    tracing::warn!(job_id = %job.id(), "Job was completed elsewhere, dropping local outcome");
                    Ok(current)
                }
                None => {
                    tracing::warn!(
                        job_id = %job.id(),
                        status = job.status().as_str(),
                        "Job record is gone, outcome not stored and no callback sent"
                    );
                    Ok(job)
                }
            };
        }

        match job.error() {
            None => tracing::info!(job_id = %job.id(), latency_ms = ?latency_ms, "Job succeeded"),
            Some(e) => tracing::warn!(
                job_id = %job.id(),
                latency_ms = ?latency_ms,
                kind = e.kind.as_str(),
                error = %e.message,
                "Job failed"
            ),
        }

        if notify {
            if let Some(url) = job.callback_url() {
                let url = url.to_string();
                let snapshot = job.clone();
                let callbacks = Arc::clone(&self.callbacks);
                self.tracker.spawn(async move {
                    callbacks.deliver(&url, &snapshot).await;
                });
            }
        }
        Ok(job)
    }

    /// 存储中的最新记录（已被淘汰时退回本地副本）
    async fn current(&self, job: Job) -> Result<Job, DispatchError> {
        Ok(self.store.get(job.id()).await?.unwrap_or(job))
    }
}

fn shutting_down() -> DispatchError {
    DispatchError::Internal("gateway shutting down".to_string())
}

/// JoinHandle 结果展开：任务 panic 或被中止视为内部错误
pub fn flatten(joined: Result<Execution, JoinError>) -> (Result<Document, DispatchError>, Option<u64>) {
    match joined {
        Ok((result, ms)) => (result, Some(ms)),
        Err(e) => (
            Err(DispatchError::Internal(format!("executor task aborted: {}", e))),
            None,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::job::Trace;
    use crate::dispatch::mode::Mode;
    use crate::dispatch::store::MemoryJobStore;
    use crate::test_support::{uniform_set, FakeExecutor};
    use serde_json::json;
    use std::time::Duration;

    fn runner(executor: FakeExecutor) -> (Arc<JobRunner>, Arc<dyn JobStore>) {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let callbacks = Arc::new(CallbackDispatcher::new(Duration::from_millis(200), None).unwrap());
        let runner = Arc::new(JobRunner::new(Arc::clone(&store), uniform_set(executor), callbacks));
        (runner, store)
    }

    fn job() -> Job {
        Job::new("gmail.triage", Mode::Flow, Document::new(), "k", None, Trace::new())
    }

    #[tokio::test]
    async fn test_run_moves_queued_to_succeeded() {
        let (runner, store) = runner(FakeExecutor::ok(Mode::Flow, json!({"ok": true})));
        let j = job();
        store.put(j.clone()).await.unwrap();

        let done = runner.run(j.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(done.status(), JobStatus::Succeeded);
        assert!(done.metrics().latency_ms.is_some());
        let stored = store.get(j.id()).await.unwrap().unwrap();
        assert_eq!(stored.result().unwrap()["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_raised() {
        let (runner, store) = runner(FakeExecutor::failing(
            Mode::Flow,
            DispatchError::NotFound("no.such.flow".into()),
        ));
        let j = job();
        store.put(j.clone()).await.unwrap();

        let done = runner.run(j, CancellationToken::new()).await.unwrap();
        assert_eq!(done.status(), JobStatus::Failed);
        assert_eq!(done.error().unwrap().message, "Not found: no.such.flow");
    }

    #[tokio::test]
    async fn test_cancelled_token_fails_job() {
        let executor = FakeExecutor::ok(Mode::Flow, json!({})).with_delay(Duration::from_secs(30));
        let calls = executor.counter();
        let (runner, store) = runner(executor);
        let j = job();
        store.put(j.clone()).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let done = runner.run(j, token).await.unwrap();
        assert_eq!(done.status(), JobStatus::Failed);
        assert!(done.error().unwrap().message.contains("shutting down"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_externally_completed_job_keeps_first_outcome() {
        let (runner, store) = runner(FakeExecutor::ok(Mode::Flow, json!({"late": true})));
        let j = job();
        store.put(j.clone()).await.unwrap();
        let running = runner.begin(&j).await.unwrap().unwrap();

        // 外部回调先完成
        let mut external = running.clone();
        external.finish(Ok(json!({"external": true}).as_object().cloned().unwrap()), None).unwrap();
        assert!(store.compare_and_swap(JobStatus::Running, external).await.unwrap());

        let done = runner.finalize(running, Ok(Document::new()), Some(1), false).await.unwrap();
        assert_eq!(done.result().unwrap()["external"], json!(true));
    }

    #[tokio::test]
    async fn test_finalize_after_record_removed_keeps_local_outcome() {
        let (runner, store) = runner(FakeExecutor::ok(Mode::Flow, json!({})));
        let j = job();
        store.put(j.clone()).await.unwrap();
        let running = runner.begin(&j).await.unwrap().unwrap();
        store.release(running.idempotency_key(), running.id()).await.unwrap();

        let done = runner.finalize(running, Ok(Document::new()), Some(1), true).await.unwrap();
        assert_eq!(done.status(), JobStatus::Succeeded);
        assert!(store.get(j.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execution_holds_permit_until_executor_returns() {
        let executor = FakeExecutor::ok(Mode::Flow, json!({})).with_delay(Duration::from_millis(100));
        let (runner, store) = runner(executor);
        let j = job();
        store.put(j.clone()).await.unwrap();
        let running = runner.begin(&j).await.unwrap().unwrap();

        let slots = Arc::new(tokio::sync::Semaphore::new(1));
        let handle = runner.spawn_execution(&running, Arc::clone(&slots).try_acquire_owned().unwrap());
        assert_eq!(slots.available_permits(), 0);
        handle.await.unwrap().0.unwrap();
        assert_eq!(slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_adopt_finishes_without_rerun() {
        let executor = FakeExecutor::ok(Mode::Flow, json!({"slow": true})).with_delay(Duration::from_millis(100));
        let calls = executor.counter();
        let (runner, store) = runner(executor);
        let j = job();
        store.put(j.clone()).await.unwrap();

        let running = runner.begin(&j).await.unwrap().unwrap();
        let permit = Arc::new(tokio::sync::Semaphore::new(1)).try_acquire_owned().unwrap();
        let handle = runner.spawn_execution(&running, permit);
        runner.adopt(running, handle, CancellationToken::new());

        runner.tracker().close();
        runner.tracker().wait().await;
        let stored = store.get(j.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Succeeded);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
