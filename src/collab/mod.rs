//! 外部协作者接口（只在接口边界定义）及其进程内实现

pub mod message;
pub mod pair_store;
pub mod providers;
pub mod sender;

pub use message::{InboundMessage, OutboundReply};
pub use pair_store::{ConversationPair, ConversationPairStore, MemoryPairStore, PairId, PairState};
pub use providers::{
    AlwaysReply, PostTurnHook, ReplyGate, RetrievalContext, RetrievalProvider, RetrievalStats,
    ToolInvoker, TurnReport,
};
pub use sender::{MessageSender, RecordingSender};
