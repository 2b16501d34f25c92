//! MessageSender：把渲染好的回复投递到聊天平台（平台细节在外部）
//!
//! RecordingSender 记录所有投递，可配置为失败，供测试与本地调试使用。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::collab::OutboundReply;

/// 消息发送接口
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, reply: &OutboundReply) -> anyhow::Result<()>;
}

/// 记录型发送器
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundReply>>,
    fail: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundReply> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 所有已投递回复的纯文本
    pub fn texts(&self) -> Vec<String> {
        self.sent().iter().map(|r| r.block.text()).collect()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, reply: &OutboundReply) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("sender configured to fail");
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reply.clone());
        Ok(())
    }
}
