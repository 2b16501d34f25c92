//! Agent 错误类型
//!
//! 只覆盖会中断控制流的失败；协议格式违规走 ChatOutcome 的类型化失败，工具失败走结构化 ToolResult，
//! 二者都不会以 AgentError 形式抛出。

use thiserror::Error;

use crate::llm::LlmError;

/// 回合编排、延迟任务与审计过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent stream failed: {0}")]
    StreamFailed(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Narration failed: {0}")]
    NarrationFailed(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    /// 协作式取消：控制信号而非故障
    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        AgentError::Storage(err.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}
