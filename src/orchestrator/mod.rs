//! 回合编排：状态机、调用轨迹、吞没与预回复、播报与快照

pub mod narration;
pub mod pre_reply;
pub mod runtime;
pub mod snapshot;
pub mod swallow;
pub mod trace;
mod turn;

pub use narration::{
    result_group_message, schedule_tool_result, tool_result_message, NarrationRequest, Narrator,
};
pub use pre_reply::{PreReplyConfig, PreReplyGate};
pub use runtime::{
    HandleResult, Orchestrator, OrchestratorBuilder, OrchestratorConfig, TurnEnd, TurnOutcome,
};
pub use snapshot::{snapshot_cache, RunSnapshot, SnapshotCache};
pub use swallow::SwallowState;
pub use trace::{canonicalize, ToolTrace, TraceEntry, TraceSource};
