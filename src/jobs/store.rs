//! 延迟任务存储
//!
//! MemoryJobStore 用于测试与无持久化部署；SqliteJobStore（async-sqlite 特性）把整条记录存为 JSON，
//! 另按 fire_at 建索引，启动时按触发时间顺序恢复。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::jobs::job::DelayedJob;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &DelayedJob) -> anyhow::Result<()>;

    /// 删除任务；返回是否存在
    async fn remove(&self, job_id: &str) -> anyhow::Result<bool>;

    /// 全部任务，按 fire_at 升序
    async fn load_all(&self) -> anyhow::Result<Vec<DelayedJob>>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, DelayedJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DelayedJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &DelayedJob) -> anyhow::Result<()> {
        self.lock().insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> anyhow::Result<bool> {
        Ok(self.lock().remove(job_id).is_some())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<DelayedJob>> {
        let mut jobs: Vec<DelayedJob> = self.lock().values().cloned().collect();
        jobs.sort_by_key(|j| j.fire_at);
        Ok(jobs)
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteJobStore;

#[cfg(feature = "async-sqlite")]
mod sqlite {
    use std::path::Path;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use super::JobStore;
    use crate::jobs::job::DelayedJob;

    /// SQLite 延迟任务存储
    #[derive(Clone)]
    pub struct SqliteJobStore {
        pool: SqlitePool,
    }

    impl SqliteJobStore {
        pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            let pool = SqlitePoolOptions::new()
                .max_connections(3)
                .connect(&db_url)
                .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS delayed_jobs (
                    job_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    fire_at INTEGER NOT NULL,
                    attempt INTEGER NOT NULL DEFAULT 0,
                    payload TEXT NOT NULL
                )",
            )
            .execute(&pool)
            .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_delayed_jobs_fire ON delayed_jobs(fire_at)")
                .execute(&pool)
                .await?;

            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl JobStore for SqliteJobStore {
        async fn save(&self, job: &DelayedJob) -> anyhow::Result<()> {
            let payload = serde_json::to_string(job)?;
            sqlx::query(
                "INSERT OR REPLACE INTO delayed_jobs (job_id, run_id, fire_at, attempt, payload)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&job.job_id)
            .bind(&job.run_id)
            .bind(job.fire_at)
            .bind(job.attempt as i64)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn remove(&self, job_id: &str) -> anyhow::Result<bool> {
            let res = sqlx::query("DELETE FROM delayed_jobs WHERE job_id = ?")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            Ok(res.rows_affected() > 0)
        }

        async fn load_all(&self) -> anyhow::Result<Vec<DelayedJob>> {
            let rows = sqlx::query("SELECT job_id, payload FROM delayed_jobs ORDER BY fire_at ASC")
                .fetch_all(&self.pool)
                .await?;

            let mut jobs = Vec::with_capacity(rows.len());
            for row in rows {
                let payload: String = row.get("payload");
                match serde_json::from_str::<DelayedJob>(&payload) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        let job_id: String = row.get("job_id");
                        tracing::warn!(job_id = %job_id, error = %e, "Skipping unreadable delayed job");
                    }
                }
            }
            Ok(jobs)
        }
    }
}
