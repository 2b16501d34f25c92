//! 回合起始快照：按 runId 缓存触发消息与上下文，供延迟任务到期时重建对话

use std::time::Duration;

use crate::collab::InboundMessage;
use crate::core::SharedCache;
use crate::jobs::DelayedJob;
use crate::memory::Message;

#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run_id: String,
    pub message: InboundMessage,
    /// 回合开始时的对话上下文（含触发消息）
    pub history: Vec<Message>,
    pub created_at_ms: i64,
}

impl RunSnapshot {
    pub fn new(run_id: impl Into<String>, message: InboundMessage, history: Vec<Message>) -> Self {
        Self {
            run_id: run_id.into(),
            message,
            history,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 缓存未命中时由任务自带的身份字段合成
    pub fn synthesize(job: &DelayedJob) -> Self {
        let text = if job.objective.is_empty() {
            format!("(scheduled follow-up for {})", job.tool_name)
        } else {
            job.objective.clone()
        };
        let message = InboundMessage {
            message_id: format!("synthetic-{}", job.job_id),
            sender_id: job.sender_id.clone(),
            sender_name: job.sender_name.clone(),
            group_id: job.group_id.clone(),
            text: text.clone(),
            timestamp_ms: job.created_at,
        };
        Self::new(job.run_id.clone(), message, vec![Message::user(text)])
    }
}

/// 编排器与 worker 共享的快照缓存
pub type SnapshotCache = SharedCache<String, RunSnapshot>;

pub fn snapshot_cache(capacity: usize, ttl: Duration) -> SnapshotCache {
    SharedCache::new(capacity, Some(ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;
    use serde_json::json;

    #[test]
    fn test_synthesized_snapshot_keeps_identity() {
        let job = DelayedJob::new(JobKind::InProgress, "run-1", "render", json!({}), 0)
            .with_identity("42", "alice", Some("g7".into()))
            .with_objective("draw a cat");
        let snap = RunSnapshot::synthesize(&job);
        assert_eq!(snap.message.conversation_key(), "G:g7");
        assert_eq!(snap.message.sender_name, "alice");
        assert_eq!(snap.history, vec![Message::user("draw a cat")]);
    }
}
