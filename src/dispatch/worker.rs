//! 后台作业池
//!
//! 有界 mpsc 队列（queue_depth）+ Semaphore 限制并发（max_concurrent_jobs）。
//! 调用方先用 reserve() 占一个队列位，占不到返回 Overloaded；占到后再建作业并 send。
//! 快速路径不排队，用 try_acquire_execution() 从另一个同样大小的 Semaphore 取许可，
//! 许可随执行任务持有到执行器返回，超时转后台的作业仍占着它。
//! 另有一个清理任务按保留时长淘汰旧作业。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::config::DispatchSection;
use crate::core::{DispatchError, ShutdownCleanup};
use crate::dispatch::job::Job;
use crate::dispatch::runner::JobRunner;
use crate::dispatch::store::JobStore;

/// 已预留的队列位
pub struct QueueSlot(OwnedPermit<Job>);

impl QueueSlot {
    pub fn send(self, job: Job) {
        self.0.send(job);
    }
}

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    queue_depth: usize,
    inline: Arc<Semaphore>,
    max_concurrent: usize,
    runner: Arc<JobRunner>,
}

impl WorkerPool {
    /// 启动分发循环与清理任务，二者随 root token 取消而退出
    pub fn start(runner: Arc<JobRunner>, cfg: &DispatchSection, root: CancellationToken) -> Self {
        let queue_depth = cfg.queue_depth.max(1);
        let (tx, rx) = mpsc::channel(queue_depth);
        let max_concurrent = cfg.max_concurrent_jobs.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        runner.tracker().spawn(dispatch_loop(
            Arc::clone(&runner),
            rx,
            semaphore,
            root.clone(),
        ));
        spawn_janitor(
            &runner,
            Duration::from_secs(cfg.janitor_interval_secs.max(1)),
            Duration::from_secs(cfg.job_retention_secs),
            root,
        );

        Self {
            tx,
            queue_depth,
            inline: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            runner,
        }
    }

    /// 预留一个队列位；队列已满返回 Overloaded
    pub fn reserve(&self) -> Result<QueueSlot, DispatchError> {
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(QueueSlot(permit)),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(queue_depth = self.queue_depth, "Background queue full, rejecting job");
                Err(DispatchError::Overloaded(self.queue_depth))
            }
            Err(TrySendError::Closed(_)) => Err(DispatchError::Internal("worker pool stopped".to_string())),
        }
    }

    /// 不排队、立即取一个执行许可；全部占用时返回 Overloaded
    pub fn try_acquire_execution(&self) -> Result<OwnedSemaphorePermit, DispatchError> {
        match Arc::clone(&self.inline).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => {
                tracing::warn!(max_concurrent = self.max_concurrent, "All execution slots busy, rejecting job");
                Err(DispatchError::Overloaded(self.max_concurrent))
            }
            Err(TryAcquireError::Closed) => Err(DispatchError::Internal("worker pool stopped".to_string())),
        }
    }
}

async fn dispatch_loop(
    runner: Arc<JobRunner>,
    mut rx: mpsc::Receiver<Job>,
    semaphore: Arc<Semaphore>,
    root: CancellationToken,
) {
    loop {
        // 先拿并发许可再取作业，等待中的作业留在队列里占着队列位
        let permit = tokio::select! {
            _ = root.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let job = tokio::select! {
            _ = root.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let worker = Arc::clone(&runner);
        let token = root.child_token();
        runner.tracker().spawn(async move {
            let _permit = permit;
            let job_id = job.id().to_string();
            if let Err(e) = worker.run(job, token).await {
                tracing::error!(job_id = %job_id, error = %e, "Background job errored");
            }
        });
    }

    // 关闭时仍在队列里的作业记为失败
    rx.close();
    while let Ok(job) = rx.try_recv() {
        fail_on_shutdown(&runner, job, &root).await;
    }
    tracing::debug!("Worker dispatch loop stopped");
}

async fn fail_on_shutdown(runner: &JobRunner, job: Job, root: &CancellationToken) {
    let job_id = job.id().to_string();
    if let Err(e) = runner.run(job, root.child_token()).await {
        tracing::error!(job_id = %job_id, error = %e, "Failed to record shutdown for queued job");
    }
}

/// 定期淘汰超过保留时长的作业
fn spawn_janitor(runner: &Arc<JobRunner>, interval: Duration, retention: Duration, root: CancellationToken) {
    let store: Arc<dyn JobStore> = Arc::clone(runner.store());
    runner.tracker().spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let cutoff = chrono::Utc::now().timestamp_millis() - retention.as_millis() as i64;
            match store.evict_before(cutoff).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(evicted = n, "Evicted expired jobs"),
                Err(e) => tracing::warn!(error = %e, "Job eviction failed"),
            }
        }
    });
}

/// 关闭时等待所有后台任务退出（root token 已取消）
#[async_trait::async_trait]
impl ShutdownCleanup for WorkerPool {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let tracker = self.runner.tracker();
        tracker.close();
        tracing::info!(pending = tracker.len(), "Draining background jobs");
        tracker.wait().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WorkerPool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::callback::CallbackDispatcher;
    use crate::dispatch::job::{Document, JobStatus, Trace};
    use crate::dispatch::mode::Mode;
    use crate::dispatch::store::MemoryJobStore;
    use crate::test_support::{uniform_set, FakeExecutor};
    use serde_json::json;

    fn pool(executor: FakeExecutor, cfg: DispatchSection, root: CancellationToken) -> (WorkerPool, Arc<dyn JobStore>) {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let callbacks = Arc::new(CallbackDispatcher::new(Duration::from_millis(200), None).unwrap());
        let runner = Arc::new(JobRunner::new(Arc::clone(&store), uniform_set(executor), callbacks));
        (WorkerPool::start(runner, &cfg, root), store)
    }

    fn job(key: &str) -> Job {
        Job::new("gmail.triage", Mode::Flow, Document::new(), key, None, Trace::new())
    }

    async fn wait_terminal(store: &Arc<dyn JobStore>, id: &str) -> Job {
        for _ in 0..200 {
            if let Some(j) = store.get(id).await.unwrap() {
                if j.is_terminal() {
                    return j;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn test_queued_job_runs_to_completion() {
        let (pool, store) = pool(
            FakeExecutor::ok(Mode::Flow, json!({"done": 1})),
            DispatchSection::default(),
            CancellationToken::new(),
        );
        let j = job("a");
        store.put(j.clone()).await.unwrap();
        pool.reserve().unwrap().send(j.clone());

        let done = wait_terminal(&store, j.id()).await;
        assert_eq!(done.status(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_full_queue_is_overloaded() {
        let cfg = DispatchSection {
            queue_depth: 1,
            ..DispatchSection::default()
        };
        let (pool, _store) = pool(FakeExecutor::ok(Mode::Flow, json!({})), cfg, CancellationToken::new());

        let first = pool.reserve().unwrap();
        assert_eq!(pool.reserve().err(), Some(DispatchError::Overloaded(1)));
        // 释放预留位后可以再次预留
        drop(first);
        assert!(pool.reserve().is_ok());
    }

    #[tokio::test]
    async fn test_inline_execution_permits_are_bounded() {
        let cfg = DispatchSection {
            max_concurrent_jobs: 2,
            ..DispatchSection::default()
        };
        let (pool, _store) = pool(FakeExecutor::ok(Mode::Flow, json!({})), cfg, CancellationToken::new());

        let first = pool.try_acquire_execution().unwrap();
        let _second = pool.try_acquire_execution().unwrap();
        assert_eq!(pool.try_acquire_execution().err(), Some(DispatchError::Overloaded(2)));
        drop(first);
        assert!(pool.try_acquire_execution().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_fails_in_flight_jobs() {
        let root = CancellationToken::new();
        let (pool, store) = pool(
            FakeExecutor::ok(Mode::Flow, json!({})).with_delay(Duration::from_secs(30)),
            DispatchSection::default(),
            root.clone(),
        );
        let j = job("slow");
        store.put(j.clone()).await.unwrap();
        pool.reserve().unwrap().send(j.clone());

        // 等到作业开始执行
        for _ in 0..200 {
            if store.get(j.id()).await.unwrap().unwrap().status() == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        root.cancel();
        pool.cleanup().await.unwrap();
        let done = store.get(j.id()).await.unwrap().unwrap();
        assert_eq!(done.status(), JobStatus::Failed);
        assert!(done.error().unwrap().message.contains("gateway shutting down"));
    }

    #[tokio::test]
    async fn test_janitor_evicts_expired_jobs() {
        let cfg = DispatchSection {
            job_retention_secs: 0,
            janitor_interval_secs: 1,
            ..DispatchSection::default()
        };
        let (_pool, store) = pool(FakeExecutor::ok(Mode::Flow, json!({})), cfg, CancellationToken::new());
        let mut j = job("old");
        j.finish(Ok(Document::new()), None).unwrap();
        store.put(j.clone()).await.unwrap();

        for _ in 0..300 {
            if store.get(j.id()).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expired job was not evicted");
    }
}
