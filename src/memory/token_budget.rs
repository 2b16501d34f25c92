//! Token 估算与回复预算
//!
//! ProtocolChat 用它统计回复的「生成量」：零 token 且无资源的合法回复视为主动沉默（no-reply），
//! 超过预算的回复按协议违规处理。

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量；空白文本为 0
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let text = text.trim();
        if text.is_empty() {
            return 0;
        }

        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;
        for c in text.chars().filter(|c| !c.is_whitespace()) {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars.div_ceil(4) + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 多段文本的总 token 数
    pub fn estimate_all<'a>(segments: impl IntoIterator<Item = &'a str>) -> usize {
        segments.into_iter().map(Self::estimate).sum()
    }
}

/// 单次回复的 token 预算；`max_tokens == 0` 表示不限制
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    pub max_tokens: usize,
}

impl TokenBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn exceeded_by(&self, tokens: usize) -> bool {
        self.max_tokens > 0 && tokens > self.max_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_empty_is_zero() {
        assert_eq!(TokenEstimator::estimate(""), 0);
        assert_eq!(TokenEstimator::estimate("   \n"), 0);
    }

    #[test]
    fn test_estimate_mixed() {
        assert_eq!(TokenEstimator::estimate("abcd"), 1);
        assert_eq!(TokenEstimator::estimate("abcde"), 2);
        assert_eq!(TokenEstimator::estimate("你好吗"), 2);
    }

    #[test]
    fn test_budget_zero_means_unlimited() {
        assert!(!TokenBudget::new(0).exceeded_by(10_000));
        assert!(TokenBudget::new(10).exceeded_by(11));
        assert!(!TokenBudget::new(10).exceeded_by(10));
    }
}
