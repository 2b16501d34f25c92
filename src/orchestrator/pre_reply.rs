//! 预回复：规划出工具后先发一句简短确认
//!
//! 单个低价值工具不发；按发送者冷却，工具数量达到阈值时无视冷却。

use std::time::Duration;

use crate::core::SharedCache;

#[derive(Debug, Clone)]
pub struct PreReplyConfig {
    pub enabled: bool,
    pub cooldown: Duration,
    /// 工具数不少于该值时绕过冷却
    pub bypass_tool_count: usize,
    pub low_value_tools: Vec<String>,
}

impl Default for PreReplyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cooldown: Duration::from_secs(60),
            bypass_tool_count: 3,
            low_value_tools: Vec::new(),
        }
    }
}

/// 按发送者的冷却判定
pub struct PreReplyGate {
    config: PreReplyConfig,
    last_sent: SharedCache<String, i64>,
}

impl PreReplyGate {
    pub fn new(config: PreReplyConfig) -> Self {
        let ttl = (!config.cooldown.is_zero()).then_some(config.cooldown);
        Self {
            last_sent: SharedCache::new(4_096, ttl),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// 判定并占用冷却（返回 true 即视为即将发送）
    pub fn acquire(&self, sender_id: &str, tool_names: &[String]) -> bool {
        if !self.config.enabled || tool_names.is_empty() {
            return false;
        }
        if tool_names.len() == 1 && self.config.low_value_tools.contains(&tool_names[0]) {
            return false;
        }
        let bypass = tool_names.len() >= self.config.bypass_tool_count.max(1);
        let key = sender_id.to_string();
        if !bypass && self.last_sent.contains(&key) {
            tracing::debug!(sender = %sender_id, "Pre-reply suppressed by cooldown");
            return false;
        }
        self.last_sent.insert(key, chrono::Utc::now().timestamp_millis());
        true
    }

    /// 取消回合时释放冷却
    pub fn release(&self, sender_id: &str) {
        self.last_sent.remove(&sender_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> PreReplyGate {
        PreReplyGate::new(PreReplyConfig {
            enabled: true,
            cooldown: Duration::from_secs(60),
            bypass_tool_count: 3,
            low_value_tools: vec!["time".into()],
        })
    }

    fn tools(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_low_value_tool_skipped() {
        assert!(!gate().acquire("u", &tools(&["time"])));
        assert!(gate().acquire("u", &tools(&["time", "search"])));
    }

    #[test]
    fn test_cooldown_and_bypass() {
        let g = gate();
        assert!(g.acquire("u", &tools(&["search"])));
        assert!(!g.acquire("u", &tools(&["search"])));
        assert!(g.acquire("v", &tools(&["search"])));
        assert!(g.acquire("u", &tools(&["a", "b", "c"])));
        g.release("u");
        assert!(g.acquire("u", &tools(&["search"])));
    }

    #[test]
    fn test_disabled() {
        let g = PreReplyGate::new(PreReplyConfig::default());
        assert!(!g.acquire("u", &tools(&["search"])));
    }
}
