//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete；失败统一为 LlmError，
//! 并按错误特征区分「瞬时」（网络、超时、限流、5xx）与「永久」失败，供 ProtocolChat 与完成度审计决定是否重试。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM network error: {0}")]
    Network(String),

    #[error("LLM rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("LLM server error: {0}")]
    Server(String),

    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM returned empty response")]
    EmptyResponse,
}

impl LlmError {
    /// 是否属于可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::Network(_)
                | LlmError::RateLimited { .. }
                | LlmError::Server(_)
        )
    }

    /// 按错误文本特征分类（底层 SDK 只给出字符串时使用）
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["timeout", "timed out", "deadline exceeded"]) {
            LlmError::Timeout
        } else if has(&["rate limit", "rate_limit", "429", "too many requests"]) {
            LlmError::RateLimited {
                retry_after_ms: None,
            }
        } else if has(&[
            "connection",
            "network",
            "econnreset",
            "econnrefused",
            "broken pipe",
            "dns error",
            "socket",
        ]) {
            LlmError::Network(message)
        } else if has(&[
            "500",
            "502",
            "503",
            "504",
            "bad gateway",
            "service unavailable",
            "overloaded",
            "internal server error",
        ]) {
            LlmError::Server(message)
        } else {
            LlmError::Api(message)
        }
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发送完整对话，返回模型输出文本
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 模型名（日志用）
    fn model_name(&self) -> &str {
        "unknown"
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient_signatures() {
        assert_eq!(LlmError::classify("request timed out after 60s"), LlmError::Timeout);
        assert!(matches!(
            LlmError::classify("HTTP 429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            LlmError::classify("error sending request: connection reset"),
            LlmError::Network(_)
        ));
        assert!(matches!(LlmError::classify("503 Service Unavailable"), LlmError::Server(_)));
        assert!(LlmError::classify("503 Service Unavailable").is_transient());
    }

    #[test]
    fn test_classify_permanent() {
        let err = LlmError::classify("invalid api key");
        assert!(matches!(err, LlmError::Api(_)));
        assert!(!err.is_transient());
        assert!(!LlmError::EmptyResponse.is_transient());
    }
}
