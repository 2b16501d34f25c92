//! 延迟任务队列：内存索引 + 持久化存储，入队时唤醒 worker

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::jobs::job::{DelayedJob, JobId};
use crate::jobs::store::{JobStore, MemoryJobStore};

pub struct DelayedJobQueue {
    store: Arc<dyn JobStore>,
    pending: Mutex<HashMap<JobId, DelayedJob>>,
    wake: Notify,
}

impl DelayedJobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    /// 纯内存队列
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryJobStore::new()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, DelayedJob>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 持久化后加入内存索引；存储失败时不入队
    pub async fn enqueue(&self, mut job: DelayedJob) -> anyhow::Result<JobId> {
        job.normalize();
        self.store.save(&job).await?;
        let job_id = job.job_id.clone();
        tracing::info!(
            job_id = %job_id,
            run_id = %job.run_id,
            tool = %job.tool_name,
            fire_at = job.fire_at,
            attempt = job.attempt,
            "Delayed job enqueued"
        );
        self.lock().insert(job_id.clone(), job);
        self.wake.notify_one();
        Ok(job_id)
    }

    /// 覆盖存储中的记录（如写入已执行的工具结果）；内存索引中仍在排队时同步更新
    pub async fn checkpoint(&self, job: &DelayedJob) -> anyhow::Result<()> {
        self.store.save(job).await?;
        if let Some(pending) = self.lock().get_mut(&job.job_id) {
            *pending = job.clone();
        }
        Ok(())
    }

    /// 从内存与存储中删除
    pub async fn remove(&self, job_id: &str) -> anyhow::Result<bool> {
        let in_memory = self.lock().remove(job_id).is_some();
        let stored = self.store.remove(job_id).await?;
        Ok(in_memory || stored)
    }

    /// 取出（从内存索引移除）所有到期任务，按 fire_at 升序
    pub fn take_due(&self, now_ms: i64) -> Vec<DelayedJob> {
        let mut pending = self.lock();
        let due: Vec<JobId> = pending
            .values()
            .filter(|j| j.is_due(now_ms))
            .map(|j| j.job_id.clone())
            .collect();
        let mut jobs: Vec<DelayedJob> = due.iter().filter_map(|id| pending.remove(id)).collect();
        jobs.sort_by_key(|j| j.fire_at);
        jobs
    }

    pub fn next_fire_at(&self) -> Option<i64> {
        self.lock().values().map(|j| j.fire_at).min()
    }

    pub fn get(&self, job_id: &str) -> Option<DelayedJob> {
        self.lock().get(job_id).cloned()
    }

    pub fn jobs(&self) -> Vec<DelayedJob> {
        let mut jobs: Vec<DelayedJob> = self.lock().values().cloned().collect();
        jobs.sort_by_key(|j| j.fire_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 从存储恢复尚未触发的任务
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let jobs = self.store.load_all().await?;
        let count = jobs.len();
        {
            let mut pending = self.lock();
            for job in jobs {
                pending.insert(job.job_id.clone(), job);
            }
        }
        if count > 0 {
            tracing::info!("Restored {} delayed jobs from store", count);
            self.wake.notify_one();
        }
        Ok(count)
    }

    /// 等待下一次入队
    pub async fn notified(&self) {
        self.wake.notified().await
    }
}
