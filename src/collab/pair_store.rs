//! ConversationPairStore：一个助手回合的转录单元（begin / append / finish / cancel）
//!
//! 真实存储由外部提供；MemoryPairStore 是进程内实现，拒绝对已关闭的会话对再次 finish/cancel，
//! 用来在测试中验证「每个会话对恰好结束一次」。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::memory::{Message, Role};

/// 会话对 ID
pub type PairId = String;

/// 会话对生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Open,
    Finished,
    Cancelled,
}

/// 一个会话对
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPair {
    pub id: PairId,
    pub conversation_key: String,
    pub entries: Vec<Message>,
    pub state: PairState,
}

/// 会话对存储接口
#[async_trait]
pub trait ConversationPairStore: Send + Sync {
    /// 开启会话对，user_content 为触发本回合的用户消息
    async fn begin(&self, conversation_key: &str, user_content: &str) -> anyhow::Result<PairId>;

    async fn append(&self, id: &PairId, role: Role, content: &str) -> anyhow::Result<()>;

    async fn finish(&self, id: &PairId) -> anyhow::Result<()>;

    async fn cancel(&self, id: &PairId) -> anyhow::Result<()>;
}

/// 内存会话对存储
#[derive(Debug, Default)]
pub struct MemoryPairStore {
    pairs: Mutex<HashMap<PairId, ConversationPair>>,
    order: Mutex<Vec<PairId>>,
    failing_finish: AtomicBool,
}

impl MemoryPairStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PairId, ConversationPair>> {
        self.pairs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &str) -> Option<ConversationPair> {
        self.lock().get(id).cloned()
    }

    /// 按创建顺序返回所有会话对
    pub fn pairs(&self) -> Vec<ConversationPair> {
        let order = self.order.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let pairs = self.lock();
        order.iter().filter_map(|id| pairs.get(id).cloned()).collect()
    }

    /// 让后续 finish 调用失败（模拟持久化故障）
    pub fn set_failing_finish(&self, fail: bool) {
        self.failing_finish.store(fail, Ordering::SeqCst);
    }

    pub fn count_in(&self, state: PairState) -> usize {
        self.lock().values().filter(|p| p.state == state).count()
    }

    fn close(&self, id: &PairId, to: PairState) -> anyhow::Result<()> {
        let mut pairs = self.lock();
        let pair = pairs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown pair {id}"))?;
        if pair.state != PairState::Open {
            anyhow::bail!("pair {id} already {:?}", pair.state);
        }
        pair.state = to;
        Ok(())
    }
}

#[async_trait]
impl ConversationPairStore for MemoryPairStore {
    async fn begin(&self, conversation_key: &str, user_content: &str) -> anyhow::Result<PairId> {
        let id = format!("pair_{}", uuid::Uuid::new_v4());
        let pair = ConversationPair {
            id: id.clone(),
            conversation_key: conversation_key.to_string(),
            entries: vec![Message::user(user_content)],
            state: PairState::Open,
        };
        self.lock().insert(id.clone(), pair);
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id.clone());
        Ok(id)
    }

    async fn append(&self, id: &PairId, role: Role, content: &str) -> anyhow::Result<()> {
        let mut pairs = self.lock();
        let pair = pairs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown pair {id}"))?;
        if pair.state != PairState::Open {
            anyhow::bail!("pair {id} is closed");
        }
        pair.entries.push(Message::new(role, content));
        Ok(())
    }

    async fn finish(&self, id: &PairId) -> anyhow::Result<()> {
        if self.failing_finish.load(Ordering::SeqCst) {
            anyhow::bail!("pair store unavailable");
        }
        self.close(id, PairState::Finished)
    }

    async fn cancel(&self, id: &PairId) -> anyhow::Result<()> {
        self.close(id, PairState::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_closes_exactly_once() {
        let store = MemoryPairStore::new();
        let id = store.begin("U:1", "hello").await.unwrap();
        store.append(&id, Role::Assistant, "hi").await.unwrap();
        store.finish(&id).await.unwrap();
        assert!(store.cancel(&id).await.is_err());
        assert!(store.finish(&id).await.is_err());
        assert!(store.append(&id, Role::Assistant, "late").await.is_err());

        let pair = store.get(&id).unwrap();
        assert_eq!(pair.state, PairState::Finished);
        assert_eq!(pair.entries.len(), 2);
    }
}
