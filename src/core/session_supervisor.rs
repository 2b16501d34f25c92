//! 回合监管：每个会话同一时刻至多一个回合
//!
//! 会话槽位持有活动回合计数、取消令牌与排队消息。回合进行中到达的消息进入队列，
//! 既作为当前回合的「补充消息」被检测，也在回合结束后按顺序成为下一回合。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::collab::InboundMessage;

/// 一个已获准开始的回合
#[derive(Debug, Clone)]
pub struct TurnTicket {
    pub conversation_key: String,
    pub cancel: CancellationToken,
    pub started_at_ms: i64,
}

/// submit 的结果
#[derive(Debug)]
pub enum Admission {
    /// 会话空闲，调用方负责运行该回合并在结束时调用 complete
    Start(TurnTicket),
    /// 会话已有回合在跑，消息已排队
    Queued { position: usize },
}

struct ConversationSlot {
    active: usize,
    cancel: CancellationToken,
    started_at_ms: i64,
    queued: VecDeque<InboundMessage>,
    notify: Arc<Notify>,
}

impl ConversationSlot {
    fn new(root: &CancellationToken) -> Self {
        Self {
            active: 1,
            cancel: root.child_token(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            queued: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn ticket(&self, key: &str) -> TurnTicket {
        TurnTicket {
            conversation_key: key.to_string(),
            cancel: self.cancel.clone(),
            started_at_ms: self.started_at_ms,
        }
    }
}

/// 会话级回合监管
pub struct TurnSupervisor {
    root: CancellationToken,
    slots: Mutex<HashMap<String, ConversationSlot>>,
}

impl TurnSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConversationSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 提交入站消息：会话空闲则开始回合，否则排队并唤醒等待补充消息的一方
    pub fn submit(&self, message: InboundMessage) -> Admission {
        let key = message.conversation_key();
        let mut slots = self.lock();
        match slots.get_mut(&key) {
            Some(slot) if slot.active > 0 => {
                slot.queued.push_back(message);
                slot.notify.notify_waiters();
                Admission::Queued {
                    position: slot.queued.len(),
                }
            }
            _ => {
                let slot = ConversationSlot::new(&self.root);
                let ticket = slot.ticket(&key);
                slots.insert(key, slot);
                Admission::Start(ticket)
            }
        }
    }

    /// 当前回合结束：若有排队消息，取出下一条并以新令牌继续占用会话；否则释放槽位
    pub fn complete(&self, conversation_key: &str) -> Option<(InboundMessage, TurnTicket)> {
        let mut slots = self.lock();
        let slot = slots.get_mut(conversation_key)?;
        match slot.queued.pop_front() {
            Some(next) => {
                slot.cancel = self.root.child_token();
                slot.started_at_ms = chrono::Utc::now().timestamp_millis();
                Some((next, slot.ticket(conversation_key)))
            }
            None => {
                slots.remove(conversation_key);
                None
            }
        }
    }

    /// 当前回合开始后是否有补充消息到达
    pub fn has_supplement(&self, conversation_key: &str) -> bool {
        self.lock()
            .get(conversation_key)
            .is_some_and(|s| !s.queued.is_empty())
    }

    /// 排队中的补充消息（不出队）
    pub fn supplements(&self, conversation_key: &str) -> Vec<InboundMessage> {
        self.lock()
            .get(conversation_key)
            .map(|s| s.queued.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 补充消息到达的通知器
    pub fn supplement_notify(&self, conversation_key: &str) -> Option<Arc<Notify>> {
        self.lock().get(conversation_key).map(|s| s.notify.clone())
    }

    /// 取消会话当前回合；返回是否存在活动回合
    pub fn cancel(&self, conversation_key: &str) -> bool {
        match self.lock().get(conversation_key) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消所有回合（关闭时）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn is_active(&self, conversation_key: &str) -> bool {
        self.lock()
            .get(conversation_key)
            .is_some_and(|s| s.active > 0)
    }

    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|s| s.active > 0).count()
    }
}

impl Default for TurnSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_message_is_queued() {
        let sup = TurnSupervisor::new();
        let first = InboundMessage::private("1", "a");
        let second = InboundMessage::private("1", "b");
        assert!(matches!(sup.submit(first), Admission::Start(_)));
        assert!(matches!(sup.submit(second), Admission::Queued { position: 1 }));
        assert!(sup.has_supplement("U:1"));
        assert_eq!(sup.supplements("U:1")[0].text, "b");

        let (next, ticket) = sup.complete("U:1").unwrap();
        assert_eq!(next.text, "b");
        assert!(!ticket.cancel.is_cancelled());
        assert!(!sup.has_supplement("U:1"));
        assert!(sup.complete("U:1").is_none());
        assert!(!sup.is_active("U:1"));
    }

    #[test]
    fn test_conversations_are_independent() {
        let sup = TurnSupervisor::new();
        assert!(matches!(sup.submit(InboundMessage::private("1", "a")), Admission::Start(_)));
        assert!(matches!(sup.submit(InboundMessage::private("2", "a")), Admission::Start(_)));
        assert_eq!(sup.active_count(), 2);
    }

    #[test]
    fn test_cancel_marks_ticket() {
        let sup = TurnSupervisor::new();
        let Admission::Start(ticket) = sup.submit(InboundMessage::private("1", "a")) else {
            panic!("expected start");
        };
        assert!(sup.cancel("U:1"));
        assert!(ticket.cancel.is_cancelled());
        assert!(!sup.cancel("U:404"));
    }

    #[tokio::test]
    async fn test_supplement_notifies_waiter() {
        let sup = Arc::new(TurnSupervisor::new());
        let _ = sup.submit(InboundMessage::private("1", "a"));
        let notify = sup.supplement_notify("U:1").unwrap();
        let waiter = notify.notified();
        let sup2 = sup.clone();
        tokio::spawn(async move {
            let _ = sup2.submit(InboundMessage::private("1", "b"));
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap();
    }
}
