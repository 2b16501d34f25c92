//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError};

use crate::config::LlmSection;

/// 根据配置选择 LLM 后端：provider 为 mock 或未设置 API Key 时退回 Mock
pub fn create_llm_from_config(section: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = section.provider.to_lowercase();
    if provider != "mock" && std::env::var("OPENAI_API_KEY").is_ok() {
        tracing::info!(model = %section.model, "Using OpenAI-compatible LLM");
        Arc::new(OpenAiClient::from_config(section))
    } else {
        tracing::warn!("No API key set or provider is mock, using Mock LLM");
        Arc::new(MockLlmClient::new())
    }
}
