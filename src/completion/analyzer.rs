//! Completion Analyzer：回合结束后的完成度审计
//!
//! 重建工具转录交给审计模型，只对瞬时错误重试；重试耗尽按 fail_open_status 放行（默认 completed）且不落盘，
//! 非瞬时错误与无法解析的判定为 unknown。只有未完成或强制时才持久化，completed 会清掉该任务之前的报告。

use std::sync::Arc;
use std::time::Duration;

use crate::completion::report::{CompletionReport, ReportStore, ToolCallRecord};
use crate::completion::transcript::{build_transcript, TranscriptLimits};
use crate::completion::verdict::{parse_verdict, CompletionStatus, CompletionVerdict};
use crate::core::{AgentError, RetryPolicy, SharedCache};
use crate::llm::LlmClient;
use crate::memory::Message;

const JUDGE_PROMPT: &str = "You audit whether an assistant actually finished the user's task. \
Read the objective, the tool trace and the final reply. Answer with JSON only: \
{\"status\": \"completed|partial|pending\", \"confidence\": 0..1, \"summary\": \"...\", \"reason\": \"...\", \
\"promises\": [{\"content\": \"...\", \"fulfilled\": true|false, \"evidence\": \"...\"}]}";

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub enabled: bool,
    /// 审计模型调用总次数上限
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub limits: TranscriptLimits,
    pub max_recovery_attempts: u32,
    /// 重试耗尽时的放行状态
    pub fail_open_status: CompletionStatus,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            limits: TranscriptLimits::default(),
            max_recovery_attempts: 2,
            fail_open_status: CompletionStatus::Completed,
        }
    }
}

/// 一次审计的输入
#[derive(Debug, Clone, Default)]
pub struct AnalysisInput {
    pub task_id: String,
    pub conversation_key: String,
    pub objective: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub final_response: Option<String>,
    /// 强制持久化（如强制取消后的审计）
    pub force: bool,
}

pub struct CompletionAnalyzer {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn ReportStore>,
    config: CompletionConfig,
    latest: SharedCache<String, CompletionVerdict>,
}

impl CompletionAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn ReportStore>, config: CompletionConfig) -> Self {
        Self {
            llm,
            store,
            config,
            latest: SharedCache::new(1_024, None),
        }
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    /// 会话最近一次判定
    pub fn latest_verdict(&self, conversation_key: &str) -> Option<CompletionVerdict> {
        self.latest.get(&conversation_key.to_string())
    }

    pub async fn analyze(&self, input: &AnalysisInput) -> CompletionVerdict {
        let transcript = build_transcript(
            &input.objective,
            &input.tool_calls,
            input.final_response.as_deref(),
            &self.config.limits,
        );
        let messages = vec![Message::system(JUDGE_PROMPT), Message::user(transcript)];
        let policy = RetryPolicy::new(self.config.max_retries, self.config.retry_backoff);

        let (verdict, persistable) = match policy.run(None, |_| self.llm.complete(&messages)).await {
            Ok(raw) => match parse_verdict(&raw) {
                Some(v) => (v, true),
                None => {
                    tracing::warn!(task_id = %input.task_id, "Unparsable completion verdict");
                    (CompletionVerdict::unknown("unparsable judge output"), true)
                }
            },
            Err(AgentError::Llm(e)) if e.is_transient() => {
                tracing::warn!(
                    task_id = %input.task_id,
                    error = %e,
                    status = self.config.fail_open_status.as_str(),
                    "Completion analysis retries exhausted, failing open"
                );
                let v = CompletionVerdict::fail_open(
                    self.config.fail_open_status,
                    format!("analyzer unavailable: {e}"),
                );
                (v, false)
            }
            Err(e) => {
                tracing::warn!(task_id = %input.task_id, error = %e, "Completion analysis failed");
                (CompletionVerdict::unknown(e.to_string()), true)
            }
        };

        if persistable {
            self.persist(input, &verdict).await;
        }
        tracing::info!(
            task_id = %input.task_id,
            conversation = %input.conversation_key,
            status = verdict.status.as_str(),
            confidence = verdict.confidence,
            "Completion verdict"
        );
        self.latest.insert(input.conversation_key.clone(), verdict.clone());
        verdict
    }

    async fn persist(&self, input: &AnalysisInput, verdict: &CompletionVerdict) {
        if verdict.status == CompletionStatus::Completed && !input.force {
            if let Err(e) = self.store.remove(&input.task_id).await {
                tracing::warn!(task_id = %input.task_id, error = %e, "Failed to clear prior completion report");
            }
            return;
        }
        if !verdict.status.is_incomplete() && !input.force {
            return;
        }

        let report = CompletionReport::new(
            input.task_id.clone(),
            input.conversation_key.clone(),
            input.objective.clone(),
            verdict,
            input.tool_calls.clone(),
            input.final_response.clone(),
        );
        match self.store.save(&report, self.config.max_recovery_attempts).await {
            Ok(Some(attempt)) => {
                tracing::info!(task_id = %input.task_id, attempt, "Completion report persisted")
            }
            Ok(None) => tracing::warn!(
                task_id = %input.task_id,
                max = self.config.max_recovery_attempts,
                "Recovery attempts exhausted, completion report dropped"
            ),
            Err(e) => {
                tracing::warn!(task_id = %input.task_id, error = %e, "Failed to persist completion report")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::report::MemoryReportStore;
    use crate::llm::{LlmError, MockLlmClient};

    fn analyzer(mock: MockLlmClient, store: Arc<MemoryReportStore>) -> CompletionAnalyzer {
        let config = CompletionConfig {
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        CompletionAnalyzer::new(Arc::new(mock), store, config)
    }

    fn input(force: bool) -> AnalysisInput {
        AnalysisInput {
            task_id: "run-1".into(),
            conversation_key: "U:1".into(),
            objective: "book a table".into(),
            tool_calls: vec![],
            final_response: Some("I'll book it soon.".into()),
            force,
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_open_without_report() {
        let mock = MockLlmClient::new();
        for _ in 0..3 {
            mock.push_err(LlmError::Timeout);
        }
        let store = Arc::new(MemoryReportStore::new());
        let a = analyzer(mock, store.clone());

        let v = a.analyze(&input(true)).await;
        assert_eq!(v.status, CompletionStatus::Completed);
        assert_eq!(v.confidence, 1.0);
        assert!(store.is_empty());
        assert_eq!(a.latest_verdict("U:1").unwrap().status, CompletionStatus::Completed);
    }

    #[tokio::test]
    async fn test_fail_open_status_is_configurable() {
        let mock = MockLlmClient::new();
        mock.push_err(LlmError::Network("reset".into()));
        let store = Arc::new(MemoryReportStore::new());
        let config = CompletionConfig {
            max_retries: 1,
            fail_open_status: CompletionStatus::Unknown,
            ..Default::default()
        };
        let a = CompletionAnalyzer::new(Arc::new(mock), store.clone(), config);
        let v = a.analyze(&input(false)).await;
        assert_eq!(v.status, CompletionStatus::Unknown);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_partial_is_persisted_and_completed_clears_it() {
        let mock = MockLlmClient::with_responses([
            r#"{"status":"pending","confidence":0.8,"summary":"not booked","promises":[{"content":"book","fulfilled":false}]}"#,
            r#"{"status":"completed","confidence":0.9}"#,
        ]);
        let store = Arc::new(MemoryReportStore::new());
        let a = analyzer(mock, store.clone());

        assert_eq!(a.analyze(&input(false)).await.status, CompletionStatus::Pending);
        let report = store.get("run-1").await.unwrap().unwrap();
        assert_eq!(report.promises.len(), 1);

        assert_eq!(a.analyze(&input(false)).await.status, CompletionStatus::Completed);
        assert!(store.get("run-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permanent_error_is_unknown_and_only_forced_persists() {
        let mock = MockLlmClient::new();
        mock.push_err(LlmError::Api("invalid model".into()));
        mock.push_err(LlmError::Api("invalid model".into()));
        let store = Arc::new(MemoryReportStore::new());
        let a = analyzer(mock, store.clone());

        let v = a.analyze(&input(false)).await;
        assert_eq!(v.status, CompletionStatus::Unknown);
        assert!(store.is_empty());

        a.analyze(&input(true)).await;
        assert_eq!(store.get("run-1").await.unwrap().unwrap().status, CompletionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_recovery_attempts_stop_persisting() {
        let pending = r#"{"status":"partial","confidence":0.5}"#;
        let mock = MockLlmClient::new().with_fallback(pending);
        let store = Arc::new(MemoryReportStore::new());
        let a = analyzer(mock, store.clone());

        for _ in 0..4 {
            a.analyze(&input(false)).await;
        }
        assert_eq!(store.get("run-1").await.unwrap().unwrap().recovery_attempt, 2);
    }
}
