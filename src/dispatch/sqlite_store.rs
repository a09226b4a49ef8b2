//! SQLite 作业存储（需启用 async-sqlite feature）
//!
//! 作业以 JSON 存在 body 列，状态、幂等键、时间戳单独成列用于条件更新与淘汰。
//! idempotency_key 列 UNIQUE：insert_if_absent 用 ON CONFLICT DO NOTHING 实现原子占位；
//! compare_and_swap 用 `UPDATE ... WHERE id = ? AND status = ?`，看受影响行数。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::core::StoreError;
use crate::dispatch::job::{Job, JobStatus};
use crate::dispatch::store::{Claim, JobStore};

pub struct SqliteJobStore {
    pool: SqlitePool,
}

fn encode(job: &Job) -> Result<String, StoreError> {
    serde_json::to_string(job).map_err(|e| StoreError(format!("encode job: {}", e)))
}

fn decode(body: &str) -> Result<Job, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError(format!("decode job: {}", e)))
}

impl SqliteJobStore {
    /// 打开（或创建）数据库文件并建表
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new().max_connections(4).connect(&db_url).await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                body TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at)")
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }

    async fn fetch_one_body(&self, sql: &str, arg: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(sql).bind(arg).fetch_optional(&self.pool).await?;
        row.map(|r| decode(&r.get::<String, _>("body"))).transpose()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.fetch_one_body("SELECT body FROM jobs WHERE id = ?", job_id).await
    }

    async fn put(&self, job: Job) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO jobs (id, idempotency_key, status, created_at, completed_at, body)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id())
        .bind(job.idempotency_key())
        .bind(job.status().as_str())
        .bind(job.created_at())
        .bind(job.completed_at())
        .bind(encode(&job)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_swap(&self, expected: JobStatus, job: Job) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, completed_at = ?, body = ? WHERE id = ? AND status = ?",
        )
        .bind(job.status().as_str())
        .bind(job.completed_at())
        .bind(encode(&job)?)
        .bind(job.id())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        self.fetch_one_body("SELECT body FROM jobs WHERE idempotency_key = ?", key)
            .await
    }

    async fn insert_if_absent(&self, job: Job) -> Result<Claim, StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO jobs (id, idempotency_key, status, created_at, completed_at, body)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(job.id())
        .bind(job.idempotency_key())
        .bind(job.status().as_str())
        .bind(job.created_at())
        .bind(job.completed_at())
        .bind(encode(&job)?)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(Claim::Created(job));
        }
        match self.find_by_key(job.idempotency_key()).await? {
            Some(existing) => Ok(Claim::Existing(existing)),
            // 冲突行恰好被淘汰
            None => Err(StoreError(format!(
                "idempotency key {} vanished during claim",
                job.idempotency_key()
            ))),
        }
    }

    async fn release(&self, key: &str, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE idempotency_key = ? AND id = ?")
            .bind(key)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn evict_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE (completed_at IS NOT NULL AND completed_at < ?)
                OR (completed_at IS NULL AND status = ? AND created_at < ?)",
        )
        .bind(cutoff_ms)
        .bind(JobStatus::Queued.as_str())
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as usize)
    }
}
