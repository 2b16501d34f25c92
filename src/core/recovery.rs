//! 重试与退避
//!
//! RetryPolicy：瞬时错误（LlmError::is_transient）按固定间隔重试，达到上限后返回最后一次错误；
//! 重试等待可被取消令牌打断。reschedule_backoff：延迟任务叙述失败后的指数退避，钳制在 [1s, 60s]。

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::LlmError;

/// 重排任务的最小退避（毫秒）
pub const MIN_RESCHEDULE_BACKOFF_MS: u64 = 1_000;
/// 重排任务的最大退避（毫秒）
pub const MAX_RESCHEDULE_BACKOFF_MS: u64 = 60_000;

/// 固定退避重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次），至少为 1
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// 执行 op；仅对瞬时错误重试。取消时返回 AgentError::Cancelled
    pub async fn run<T, F, Fut>(
        &self,
        cancel: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T, AgentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(AgentError::Cancelled);
            }
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Transient LLM error, retrying");
                    sleep_or_cancel(self.backoff, cancel).await?;
                }
                Err(e) => return Err(AgentError::Llm(e)),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1_000))
    }
}

/// 等待 dur；若期间取消则返回 Cancelled
pub async fn sleep_or_cancel(
    dur: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<(), AgentError> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(AgentError::Cancelled),
            _ = tokio::time::sleep(dur) => Ok(()),
        },
        None => {
            tokio::time::sleep(dur).await;
            Ok(())
        }
    }
}

/// 第 attempt 次重排的退避：base * 2^attempt，钳制在 [1000, 60000] 毫秒
pub fn reschedule_backoff(attempt: u32, base_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt.min(30)).unwrap_or(u64::MAX);
    base_ms
        .saturating_mul(factor)
        .clamp(MIN_RESCHEDULE_BACKOFF_MS, MAX_RESCHEDULE_BACKOFF_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_reschedule_backoff_clamped() {
        assert_eq!(reschedule_backoff(0, 0), MIN_RESCHEDULE_BACKOFF_MS);
        assert_eq!(reschedule_backoff(0, 2_000), 2_000);
        assert_eq!(reschedule_backoff(3, 2_000), 16_000);
        assert_eq!(reschedule_backoff(10, 2_000), MAX_RESCHEDULE_BACKOFF_MS);
        assert_eq!(reschedule_backoff(u32::MAX, u64::MAX), MAX_RESCHEDULE_BACKOFF_MS);
    }

    #[tokio::test]
    async fn test_retry_transient_then_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let out = policy
            .run(None, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(LlmError::Timeout)
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let err = policy
            .run(None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LlmError::Api("bad key".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(LlmError::Api(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(30));
        let t = token.clone();
        let err = policy
            .run(Some(&token), move |_| {
                t.cancel();
                async { Err::<(), _>(LlmError::Timeout) }
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
