//! 核心层：错误、重试与退避、有界 TTL 缓存、会话回合监管

pub mod cache;
pub mod error;
pub mod recovery;
pub mod session_supervisor;

pub use cache::{SharedCache, TtlCache};
pub use error::AgentError;
pub use recovery::{reschedule_backoff, sleep_or_cancel, RetryPolicy};
pub use session_supervisor::{Admission, TurnSupervisor, TurnTicket};
