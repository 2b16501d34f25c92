//! 补充消息吞没：生成回复期间用户又发来消息时，回复只写入历史不外发
//!
//! 每个会话一个一次性标记：吞没时置位，下一次真实发送时清除，保证两次真实发送之间至多吞没一次。

use crate::core::SharedCache;

pub struct SwallowState {
    flags: SharedCache<String, ()>,
}

impl SwallowState {
    pub fn new(capacity: usize) -> Self {
        Self {
            flags: SharedCache::new(capacity, None),
        }
    }

    /// 尝试吞没一次回复；自上次真实发送以来已吞没过则返回 false
    pub fn try_swallow(&self, conversation_key: &str) -> bool {
        self.flags.insert_if_absent(conversation_key.to_string(), ())
    }

    /// 真实发送后清除标记
    pub fn on_sent(&self, conversation_key: &str) {
        self.flags.remove(&conversation_key.to_string());
    }

    pub fn is_swallowed(&self, conversation_key: &str) -> bool {
        self.flags.contains(&conversation_key.to_string())
    }
}

impl Default for SwallowState {
    fn default() -> Self {
        Self::new(4_096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_most_one_swallow_between_sends() {
        let state = SwallowState::default();
        assert!(state.try_swallow("U:1"));
        assert!(!state.try_swallow("U:1"));
        assert!(state.try_swallow("U:2"));

        state.on_sent("U:1");
        assert!(!state.is_swallowed("U:1"));
        assert!(state.try_swallow("U:1"));
    }
}
