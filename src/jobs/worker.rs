//! 延迟任务 worker
//!
//! 到期任务先从队列与存储删除再执行：重建上下文（快照缓存或合成）→ 进行中/计划确认任务重放播报，
//! 延迟执行任务直调工具一次再播报 → 播报失败以新 id 重排，退避钳制在 [1s, 60s]，已得到的工具结果随任务携带。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::ToolResult;
use crate::collab::{ConversationPairStore, MessageSender, OutboundReply, ToolInvoker};
use crate::core::{reschedule_backoff, AgentError};
use crate::jobs::job::{DelayedJob, JobId};
use crate::jobs::queue::DelayedJobQueue;
use crate::memory::Role;
use crate::orchestrator::narration::{schedule_tool_result, NarrationRequest, Narrator};
use crate::orchestrator::snapshot::{RunSnapshot, SnapshotCache};
use crate::protocol::ResponseBlock;

/// worker 运行配置
#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub poll_interval: Duration,
    /// 重排退避基数（毫秒）
    pub reschedule_base_ms: u64,
    pub tool_timeout: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reschedule_base_ms: 1_000,
            tool_timeout: Duration::from_secs(60),
        }
    }
}

/// 单个任务的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Delivered(ResponseBlock),
    /// 模型选择沉默
    Silent,
    /// 播报失败，已以新 id 重排
    Rescheduled(JobId),
    /// 重排也失败（存储不可用）；原记录留在存储中，重启恢复后再试
    Dropped,
}

pub struct JobWorker {
    queue: Arc<DelayedJobQueue>,
    narrator: Narrator,
    sender: Arc<dyn MessageSender>,
    pairs: Arc<dyn ConversationPairStore>,
    snapshots: Arc<SnapshotCache>,
    tools: Option<Arc<dyn ToolInvoker>>,
    config: JobsConfig,
}

impl JobWorker {
    pub fn new(
        queue: Arc<DelayedJobQueue>,
        narrator: Narrator,
        sender: Arc<dyn MessageSender>,
        pairs: Arc<dyn ConversationPairStore>,
        snapshots: Arc<SnapshotCache>,
        config: JobsConfig,
    ) -> Self {
        Self {
            queue,
            narrator,
            sender,
            pairs,
            snapshots,
            tools: None,
            config,
        }
    }

    pub fn with_tool_invoker(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn queue(&self) -> &Arc<DelayedJobQueue> {
        &self.queue
    }

    /// 执行一个到期任务；存储中的记录在送达或重排成功后才删除
    pub async fn run(&self, job: DelayedJob) -> JobOutcome {
        let snapshot = self.snapshots.get(&job.run_id).unwrap_or_else(|| {
            tracing::debug!(job_id = %job.job_id, run_id = %job.run_id, "Run snapshot missed, synthesizing context");
            RunSnapshot::synthesize(&job)
        });

        let (result, executed) = self.resolve_result(&job).await;
        if executed {
            self.checkpoint_result(&job, &result).await;
        }
        let request = NarrationRequest {
            target: snapshot.message.default_target(),
            history: snapshot.history.clone(),
            tool_name: job.tool_name.clone(),
            args: job.args.clone(),
            result: result.clone(),
        };

        let carried = executed.then_some(result);
        match self.narrator.compose(&request, None).await {
            Ok(outcome) if outcome.success && outcome.no_reply => {
                tracing::info!(job_id = %job.job_id, "Delayed job narration chose silence");
                self.retire(&job).await;
                JobOutcome::Silent
            }
            Ok(outcome) => {
                let reply = outcome.reply().cloned();
                match reply {
                    Some(block) => {
                        self.deliver(&job, &snapshot, &block).await;
                        self.retire(&job).await;
                        JobOutcome::Delivered(block)
                    }
                    None => {
                        let err = AgentError::NarrationFailed(outcome.reason.unwrap_or_default());
                        self.reschedule(&job, carried, &err).await
                    }
                }
            }
            Err(err) => self.reschedule(&job, carried, &err).await,
        }
    }

    /// 工具已执行：先把结果写回存储，播报前崩溃也不会重跑工具
    async fn checkpoint_result(&self, job: &DelayedJob, result: &ToolResult) {
        let mut stored = job.clone();
        stored.result = Some(result.clone());
        if let Err(e) = self.queue.checkpoint(&stored).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Failed to checkpoint delayed tool result");
        }
    }

    async fn retire(&self, job: &DelayedJob) {
        if let Err(e) = self.queue.remove(&job.job_id).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Failed to remove fired job from store");
        }
    }

    /// 返回（结果，是否刚执行了工具）
    async fn resolve_result(&self, job: &DelayedJob) -> (ToolResult, bool) {
        if let Some(result) = &job.result {
            return (result.clone(), false);
        }
        if job.is_delayed_exec() {
            let result = match &self.tools {
                Some(tools) => {
                    tracing::info!(job_id = %job.job_id, tool = %job.tool_name, "Executing delayed tool");
                    tools.invoke(&job.tool_name, &job.args, self.config.tool_timeout).await
                }
                None => ToolResult::failure("NO_TOOL_INVOKER", "no tool invoker configured"),
            };
            return (result, true);
        }
        let result = schedule_tool_result(
            job.kind.into(),
            job.schedule.as_ref(),
            job.delay_ms,
            Some(job.reason.as_str()),
        );
        (result, false)
    }

    async fn deliver(&self, job: &DelayedJob, snapshot: &RunSnapshot, block: &ResponseBlock) {
        let key = snapshot.message.conversation_key();
        let text = block.text();
        match self.pairs.begin(&key, &snapshot.message.text).await {
            Ok(pair) => {
                let persisted = async {
                    self.pairs.append(&pair, Role::Assistant, &text).await?;
                    self.pairs.finish(&pair).await
                };
                if let Err(e) = persisted.await {
                    tracing::warn!(job_id = %job.job_id, error = %e, "Failed to persist narration");
                    if let Err(e) = self.pairs.cancel(&pair).await {
                        tracing::warn!(job_id = %job.job_id, error = %e, "Failed to cancel conversation pair");
                    }
                }
            }
            Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "Failed to open conversation pair"),
        }

        let reply = OutboundReply {
            conversation_key: key,
            block: block.clone(),
            reply_to: None,
        };
        if let Err(e) = self.sender.send(&reply).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Failed to send delayed job narration");
        }
    }

    async fn reschedule(&self, job: &DelayedJob, result: Option<ToolResult>, err: &AgentError) -> JobOutcome {
        let backoff = reschedule_backoff(job.attempt, self.config.reschedule_base_ms);
        let now = chrono::Utc::now().timestamp_millis();
        let next = job.rescheduled(backoff, now, result);
        tracing::warn!(
            job_id = %job.job_id,
            next_job_id = %next.job_id,
            backoff_ms = backoff,
            error = %err,
            "Narration failed, rescheduling delayed job"
        );
        match self.queue.enqueue(next).await {
            Ok(id) => {
                self.retire(job).await;
                JobOutcome::Rescheduled(id)
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Failed to reschedule delayed job, keeping stored record");
                JobOutcome::Dropped
            }
        }
    }

    /// 轮询到期任务直到取消；入队会提前唤醒
    pub async fn run_until_cancelled(&self, cancel: CancellationToken) {
        tracing::info!("Delayed job worker started");
        loop {
            let now = chrono::Utc::now().timestamp_millis();
            for job in self.queue.take_due(now) {
                if cancel.is_cancelled() {
                    break;
                }
                let job_id = job.job_id.clone();
                let outcome = self.run(job).await;
                tracing::debug!(job_id = %job_id, ?outcome, "Delayed job processed");
            }

            let poll = self.config.poll_interval;
            let wait = self
                .queue
                .next_fire_at()
                .map(|t| Duration::from_millis((t - now).max(0) as u64).min(poll))
                .unwrap_or(poll);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!("Delayed job worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ScheduleDescriptor, ScheduleMode};
    use crate::collab::{InboundMessage, MemoryPairStore, PairState, RecordingSender};
    use crate::core::recovery::{MAX_RESCHEDULE_BACKOFF_MS, MIN_RESCHEDULE_BACKOFF_MS};
    use crate::jobs::{JobKind, JobStore, MemoryJobStore};
    use crate::llm::MockLlmClient;
    use crate::memory::Message;
    use crate::protocol::{ProtocolChat, ProtocolConfig};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTools(AtomicUsize);

    #[async_trait]
    impl ToolInvoker for CountingTools {
        async fn invoke(&self, _tool: &str, _args: &Value, _timeout: Duration) -> ToolResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            ToolResult::ok(json!({"report": "ready"}))
        }
    }

    struct Harness {
        worker: JobWorker,
        sender: Arc<RecordingSender>,
        pairs: Arc<MemoryPairStore>,
        snapshots: Arc<SnapshotCache>,
    }

    fn harness(mock: MockLlmClient) -> Harness {
        harness_with(mock, DelayedJobQueue::in_memory(), Arc::new(MemoryPairStore::new()))
    }

    fn harness_with(
        mock: MockLlmClient,
        queue: DelayedJobQueue,
        pairs: Arc<MemoryPairStore>,
    ) -> Harness {
        let config = ProtocolConfig {
            max_retries: 1,
            format_fix: false,
            transport_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let chat = Arc::new(ProtocolChat::new(Arc::new(mock), config));
        let sender = Arc::new(RecordingSender::new());
        let snapshots = Arc::new(crate::orchestrator::snapshot::snapshot_cache(16, Duration::from_secs(60)));
        let worker = JobWorker::new(
            Arc::new(queue),
            Narrator::new(chat),
            sender.clone(),
            pairs.clone(),
            snapshots.clone(),
            JobsConfig::default(),
        );
        Harness {
            worker,
            sender,
            pairs,
            snapshots,
        }
    }

    // 期望回复却只有工具块，确定性修复也救不回来
    const UNREPAIRABLE: &str = r#"<sentra-tools><invoke name="noop"></invoke></sentra-tools>"#;

    fn job() -> DelayedJob {
        DelayedJob::new(JobKind::Scheduled, "run-1", "remind", json!({"what": "tea"}), 0)
            .with_identity("42", "alice", None)
            .with_objective("remind me about tea")
    }

    #[tokio::test]
    async fn test_narration_delivered_from_snapshot() {
        let h = harness(MockLlmClient::with_responses([
            "<sentra-response><user_id>42</user_id><text1>Tea time!</text1></sentra-response>",
        ]));
        let msg = InboundMessage::private("42", "remind me about tea");
        h.snapshots.insert(
            "run-1".into(),
            RunSnapshot::new("run-1", msg.clone(), vec![Message::user(msg.text.clone())]),
        );

        let outcome = h.worker.run(job()).await;
        assert!(matches!(outcome, JobOutcome::Delivered(_)));
        assert_eq!(h.sender.texts(), vec!["Tea time!"]);
        assert_eq!(h.pairs.count_in(PairState::Finished), 1);
    }

    #[tokio::test]
    async fn test_narration_failure_reschedules_with_clamped_backoff() {
        let h = harness(MockLlmClient::with_responses([UNREPAIRABLE]));
        let original = job();
        h.worker.queue().enqueue(original.clone()).await.unwrap();

        let before = chrono::Utc::now().timestamp_millis();
        let outcome = h.worker.run(original.clone()).await;
        let JobOutcome::Rescheduled(new_id) = outcome else {
            panic!("expected reschedule, got {outcome:?}");
        };

        assert_ne!(new_id, original.job_id);
        assert!(h.worker.queue().get(&original.job_id).is_none());
        let next = h.worker.queue().get(&new_id).unwrap();
        let delta = next.fire_at - before;
        assert!(delta >= MIN_RESCHEDULE_BACKOFF_MS as i64 - 50);
        assert!(delta <= MAX_RESCHEDULE_BACKOFF_MS as i64 + 1_000);
        assert_eq!(next.attempt, 1);
        assert_eq!(h.sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_delayed_exec_runs_tool_once_and_carries_result() {
        let h = harness(MockLlmClient::with_responses([
            UNREPAIRABLE,
            "<sentra-response><user_id>42</user_id><text1>Report ready.</text1></sentra-response>",
        ]));
        let tools = Arc::new(CountingTools(AtomicUsize::new(0)));
        let worker = h.worker.with_tool_invoker(tools.clone());
        let exec_job = job().with_schedule(ScheduleDescriptor {
            mode: ScheduleMode::DelayedExec,
            ..Default::default()
        });

        let JobOutcome::Rescheduled(new_id) = worker.run(exec_job).await else {
            panic!("first narration should fail");
        };
        let retry = worker.queue().get(&new_id).unwrap();
        assert!(retry.result.is_some());

        let outcome = worker.run(retry).await;
        assert!(matches!(outcome, JobOutcome::Delivered(_)));
        assert_eq!(tools.0.load(Ordering::SeqCst), 1);
        assert_eq!(h.sender.texts(), vec!["Report ready."]);
    }

    #[tokio::test]
    async fn test_run_until_cancelled_fires_due_job() {
        let h = harness(MockLlmClient::with_responses([
            "<sentra-response><user_id>42</user_id><text1>Done.</text1></sentra-response>",
        ]));
        let worker = Arc::new(h.worker);
        worker.queue().enqueue(job()).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let worker = worker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run_until_cancelled(cancel).await })
        };

        for _ in 0..50 {
            if h.sender.sent_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(h.sender.texts(), vec!["Done."]);
        assert!(worker.queue().is_empty());
    }
    /// 只接受已有记录的覆盖写入；新 id 的写入失败（模拟存储在重排时不可用）
    #[derive(Default)]
    struct RejectNewStore {
        inner: MemoryJobStore,
        reject_new: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl JobStore for RejectNewStore {
        async fn save(&self, job: &DelayedJob) -> anyhow::Result<()> {
            if self.reject_new.load(Ordering::SeqCst) {
                let known = self.inner.load_all().await?.iter().any(|j| j.job_id == job.job_id);
                if !known {
                    anyhow::bail!("store unavailable");
                }
            }
            self.inner.save(job).await
        }

        async fn remove(&self, job_id: &str) -> anyhow::Result<bool> {
            self.inner.remove(job_id).await
        }

        async fn load_all(&self) -> anyhow::Result<Vec<DelayedJob>> {
            self.inner.load_all().await
        }
    }

    #[tokio::test]
    async fn test_stored_job_survives_until_delivery() {
        let store = Arc::new(RejectNewStore::default());
        let h = harness_with(
            MockLlmClient::with_responses([
                UNREPAIRABLE,
                "<sentra-response><user_id>42</user_id><text1>Report ready.</text1></sentra-response>",
            ]),
            DelayedJobQueue::new(store.clone()),
            Arc::new(MemoryPairStore::new()),
        );
        let tools = Arc::new(CountingTools(AtomicUsize::new(0)));
        let worker = h.worker.with_tool_invoker(tools.clone());
        let exec_job = job().with_schedule(ScheduleDescriptor {
            mode: ScheduleMode::DelayedExec,
            ..Default::default()
        });
        worker.queue().enqueue(exec_job.clone()).await.unwrap();
        let fired = worker.queue().take_due(i64::MAX).pop().unwrap();
        store.reject_new.store(true, Ordering::SeqCst);

        // 播报失败且重排写不进存储：原记录保留，并带上已执行的结果
        let outcome = worker.run(fired).await;
        assert_eq!(outcome, JobOutcome::Dropped);
        let stored = store.load_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].job_id, exec_job.job_id);
        assert!(stored[0].result.is_some());

        // 重启恢复后再次触发：不重跑工具，送达后删除记录
        store.reject_new.store(false, Ordering::SeqCst);
        assert_eq!(worker.queue().restore().await.unwrap(), 1);
        let restored = worker.queue().take_due(i64::MAX).pop().unwrap();
        let outcome = worker.run(restored).await;
        assert!(matches!(outcome, JobOutcome::Delivered(_)));
        assert_eq!(tools.0.load(Ordering::SeqCst), 1);
        assert!(store.load_all().await.unwrap().is_empty());
        assert_eq!(h.sender.texts(), vec!["Report ready."]);
    }

    #[tokio::test]
    async fn test_unpersisted_narration_pair_is_cancelled() {
        let pairs = Arc::new(MemoryPairStore::new());
        let h = harness_with(
            MockLlmClient::with_responses([
                "<sentra-response><user_id>42</user_id><text1>Tea time!</text1></sentra-response>",
            ]),
            DelayedJobQueue::in_memory(),
            pairs.clone(),
        );
        pairs.set_failing_finish(true);

        let outcome = h.worker.run(job()).await;

        assert!(matches!(outcome, JobOutcome::Delivered(_)));
        assert_eq!(h.sender.texts(), vec!["Tea time!"]);
        assert_eq!(pairs.count_in(PairState::Cancelled), 1);
        assert_eq!(pairs.count_in(PairState::Open), 0);
    }
}
