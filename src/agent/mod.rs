//! Agent Stream：事件类型与事件源接口

pub mod events;
pub mod stream;

pub use events::{
    AgentEvent, ArgsItem, ExecSummary, OrderingKey, PlanStep, ResultKind, ScheduleDescriptor,
    ScheduleMode, ToolChoiceStatus, ToolResult, ToolResultEvent,
};
pub use stream::{
    AgentEventStream, AgentRequest, AgentRun, AgentStream, DirectReplyAgent, ScriptedAgentStream,
};
