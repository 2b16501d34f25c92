//! 结构化输出协议：块类型、校验器、确定性修复与 ProtocolChat

pub mod block;
pub mod chat;
pub mod repair;
pub mod validator;

pub use block::{
    escape_xml, unescape_xml, BlockKind, ExpectedOutput, ProtocolResponse, Resource, ResponseBlock,
    RoutingTarget, ToolCall, ToolsBlock,
};
pub use chat::{
    CallOptions, ChatOutcome, FormatFixer, LlmFormatFixer, ProtocolChat, ProtocolConfig,
    ToolsOnlyPolicy,
};
pub use validator::{ProtocolBlockValidator, Validation, Violation};
