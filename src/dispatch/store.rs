//! 作业存储抽象层
//!
//! 作业记录与幂等键索引放在同一个存储里：insert_if_absent 在一次原子操作内完成
//! 「查键 + 建作业」，compare_and_swap 只在当前状态与预期一致时替换记录。
//! 所有读改写都必须走这些原子操作，不能跨 await 拆成先读后写。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::StoreError;
use crate::dispatch::job::{Job, JobId, JobStatus};

/// insert_if_absent 的结果
#[derive(Debug, Clone)]
pub enum Claim {
    /// 键此前不存在，传入的作业已写入
    Created(Job),
    /// 键已被占用，返回已有作业
    Existing(Job),
}

/// 作业存储接口
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// 无条件写入（覆盖同 id 记录），同时登记其幂等键
    async fn put(&self, job: Job) -> Result<(), StoreError>;

    /// 当前记录状态等于 expected 时替换为 job，返回是否替换成功
    async fn compare_and_swap(&self, expected: JobStatus, job: Job) -> Result<bool, StoreError>;

    async fn find_by_key(&self, key: &str) -> Result<Option<Job>, StoreError>;

    /// 幂等键不存在时写入作业；存在时返回已有作业
    async fn insert_if_absent(&self, job: Job) -> Result<Claim, StoreError>;

    /// 撤销一次占位：仅当 key 仍指向 job_id 时删除键与作业
    async fn release(&self, key: &str, job_id: &str) -> Result<(), StoreError>;

    /// 淘汰 cutoff 之前完成的终态作业，以及 cutoff 之前创建、仍在排队的作业；Running 作业不淘汰
    async fn evict_before(&self, cutoff_ms: i64) -> Result<usize, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    keys: HashMap<String, JobId>,
}

/// 内存作业存储：作业表与键索引共用一把锁
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(job_id).cloned())
    }

    async fn put(&self, job: Job) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .keys
            .insert(job.idempotency_key().to_string(), job.id().to_string());
        inner.jobs.insert(job.id().to_string(), job);
        Ok(())
    }

    async fn compare_and_swap(&self, expected: JobStatus, job: Job) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(job.id()) {
            Some(current) if current.status() == expected => {
                *current = job;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.keys.get(key).and_then(|id| inner.jobs.get(id)).cloned())
    }

    async fn insert_if_absent(&self, job: Job) -> Result<Claim, StoreError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .keys
            .get(job.idempotency_key())
            .and_then(|id| inner.jobs.get(id))
            .cloned();
        if let Some(existing) = existing {
            return Ok(Claim::Existing(existing));
        }
        inner
            .keys
            .insert(job.idempotency_key().to_string(), job.id().to_string());
        inner.jobs.insert(job.id().to_string(), job.clone());
        Ok(Claim::Created(job))
    }

    async fn release(&self, key: &str, job_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.keys.get(key).map(String::as_str) == Some(job_id) {
            inner.keys.remove(key);
            inner.jobs.remove(job_id);
        }
        Ok(())
    }

    async fn evict_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let expired: Vec<(JobId, String)> = inner
            .jobs
            .values()
            .filter(|job| match job.status() {
                JobStatus::Running => false,
                JobStatus::Queued => job.created_at() < cutoff_ms,
                JobStatus::Succeeded | JobStatus::Failed => {
                    job.completed_at().unwrap_or_else(|| job.created_at()) < cutoff_ms
                }
            })
            .map(|job| (job.id().to_string(), job.idempotency_key().to_string()))
            .collect();

        for (id, key) in &expired {
            inner.jobs.remove(id);
            if inner.keys.get(key) == Some(id) {
                inner.keys.remove(key);
            }
        }
        Ok(expired.len())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().await.jobs.len())
    }
}
