//! 其余外部协作者接口：回复闸门、检索、工具直调、回合后钩子

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::agent::ToolResult;
use crate::collab::InboundMessage;

/// 「这条消息是否值得一个回合」的判定，作为不透明谓词使用
#[async_trait]
pub trait ReplyGate: Send + Sync {
    async fn should_reply(&self, message: &InboundMessage) -> bool;
}

/// 总是放行
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReply;

#[async_trait]
impl ReplyGate for AlwaysReply {
    async fn should_reply(&self, _message: &InboundMessage) -> bool {
        true
    }
}

/// 检索结果统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalStats {
    pub hits: usize,
    pub elapsed_ms: u64,
}

/// 检索得到的上下文
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalContext {
    pub text: String,
    pub stats: RetrievalStats,
}

/// 检索增强上下文提供者（尽力而为，调用方施加超时）
#[async_trait]
pub trait RetrievalProvider: Send + Sync {
    async fn retrieve(&self, query: &str, conversation_key: &str)
        -> anyhow::Result<RetrievalContext>;
}

/// 直接执行工具（延迟执行任务到期时使用）；失败也必须以结构化 ToolResult 返回
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, args: &Value, timeout: Duration) -> ToolResult;
}

/// 回合结束后的摘要，交给 PostTurnHook（如会话摘要）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReport {
    pub conversation_key: String,
    pub run_id: Option<String>,
    pub objective: String,
    pub final_text: Option<String>,
    pub tool_calls: usize,
}

/// 回合后异步钩子
#[async_trait]
pub trait PostTurnHook: Send + Sync {
    async fn after_turn(&self, report: &TurnReport);
}
