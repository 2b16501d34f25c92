//! 记忆层：对话消息与 token 估算

pub mod conversation;
pub mod token_budget;

pub use conversation::{clip_chars, trim_history, Message, Role};
pub use token_budget::{TokenBudget, TokenEstimator};
