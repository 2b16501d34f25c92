//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设输出或错误；脚本耗尽后返回 fallback（未设置时报错），并记录每次收到的对话。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

/// 脚本化 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以若干成功输出构造
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for r in responses {
            mock.push_ok(r);
        }
        mock
    }

    /// 脚本耗尽后始终返回该输出
    pub fn with_fallback(mut self, output: impl Into<String>) -> Self {
        self.fallback = Some(output.into());
        self
    }

    pub fn push_ok(&self, output: impl Into<String>) {
        self.lock_script().push_back(Ok(output.into()));
    }

    pub fn push_err(&self, err: LlmError) {
        self.lock_script().push_back(Err(err));
    }

    /// 已发生的调用次数
    pub fn call_count(&self) -> usize {
        self.lock_requests().len()
    }

    /// 所有调用收到的对话（按时间顺序）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.lock_requests().clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<Vec<Message>>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.lock_requests().push(messages.to_vec());
        match self.lock_script().pop_front() {
            Some(next) => next,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::Api("mock script exhausted".to_string())),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_script_order_and_fallback() {
        let mock = MockLlmClient::with_responses(["a"]).with_fallback("z");
        mock.push_err(LlmError::Timeout);
        assert_eq!(mock.complete(&[]).await.unwrap(), "a");
        assert_eq!(mock.complete(&[]).await, Err(LlmError::Timeout));
        assert_eq!(mock.complete(&[]).await.unwrap(), "z");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_exhausted_without_fallback() {
        let mock = MockLlmClient::new();
        let err = mock.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Api(_)));
        assert_eq!(mock.requests()[0][0].content, "hi");
    }
}
