//! 计划/进行中信号的播报
//!
//! 编排器的 SCHEDULE 阶段与 worker 到期重放共用：把信号包装为合成工具结果，注入 `<sentra-result>`，
//! 再经 ProtocolChat 生成一条简短回复。

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::agent::{ScheduleDescriptor, ToolChoiceStatus, ToolResult};
use crate::core::AgentError;
use crate::memory::Message;
use crate::orchestrator::trace::TraceEntry;
use crate::protocol::{escape_xml, CallOptions, ChatOutcome, ProtocolChat, RoutingTarget};

/// 把 tool_choice 信号包装为合成工具结果
pub fn schedule_tool_result(
    status: ToolChoiceStatus,
    schedule: Option<&ScheduleDescriptor>,
    delay_ms: u64,
    reason: Option<&str>,
) -> ToolResult {
    let code = match status {
        ToolChoiceStatus::InProgress => "IN_PROGRESS",
        ToolChoiceStatus::Scheduled => "SCHEDULED",
    };
    let mut result = ToolResult::ok(json!({
        "status": status,
        "schedule": schedule,
        "delayMs": delay_ms,
    }));
    result.code = code.to_string();
    if let Some(reason) = reason.filter(|r| !r.is_empty()) {
        result = result.with_message(reason);
    }
    result
}

/// 以只读的 `<sentra-result>` 注入一次工具结果
pub fn tool_result_message(tool_name: &str, args: &Value, result: &ToolResult) -> Message {
    let body = json!({ "args": args, "result": result });
    Message::user(format!(
        "<sentra-result tool=\"{}\">\n{}\n</sentra-result>",
        escape_xml(tool_name),
        body
    ))
}

/// 汇总本回合全部工具结果，一次注入
pub fn result_group_message<'a>(entries: impl IntoIterator<Item = &'a TraceEntry>) -> Message {
    let mut body = String::from("<sentra-result-group>\n");
    for entry in entries {
        let result = entry.result.clone().unwrap_or_else(|| {
            ToolResult::failure("NO_RESULT", "tool produced no result")
        });
        body.push_str(&tool_result_message(&entry.tool_name, &entry.args, &result).content);
        body.push('\n');
    }
    body.push_str("</sentra-result-group>");
    Message::user(body)
}

/// 一次播报请求
#[derive(Debug, Clone)]
pub struct NarrationRequest {
    pub target: RoutingTarget,
    pub history: Vec<Message>,
    pub tool_name: String,
    pub args: Value,
    pub result: ToolResult,
}

impl NarrationRequest {
    pub fn conversation(&self) -> Vec<Message> {
        let mut convo = self.history.clone();
        convo.push(tool_result_message(&self.tool_name, &self.args, &self.result));
        convo.push(Message::user(
            "Tell the user about the tool status above in one short reply.",
        ));
        convo
    }
}

/// 播报器
#[derive(Clone)]
pub struct Narrator {
    chat: Arc<ProtocolChat>,
}

impl Narrator {
    pub fn new(chat: Arc<ProtocolChat>) -> Self {
        Self { chat }
    }

    pub fn chat(&self) -> &Arc<ProtocolChat> {
        &self.chat
    }

    /// 生成播报；格式失败体现在 ChatOutcome.success
    pub async fn compose(
        &self,
        request: &NarrationRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<ChatOutcome, AgentError> {
        let mut options = CallOptions::response(Some(request.target.clone()));
        options.cancel = cancel;
        self.chat.call(&request.conversation(), &options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScheduleMode;

    #[test]
    fn test_schedule_result_shape() {
        let schedule = ScheduleDescriptor {
            target_ts: Some(1_700_000_000_000),
            timezone: Some("Asia/Shanghai".into()),
            text: "tomorrow 8am".into(),
            mode: ScheduleMode::DelayedExec,
        };
        let result = schedule_tool_result(ToolChoiceStatus::Scheduled, Some(&schedule), 0, Some("reminder"));
        assert!(result.success);
        assert_eq!(result.code, "SCHEDULED");
        assert_eq!(result.data["status"], "scheduled");
        assert_eq!(result.data["schedule"]["mode"], "delayed_exec");
        assert_eq!(result.message.as_deref(), Some("reminder"));
    }

    #[test]
    fn test_result_message_is_reserved_injection() {
        let msg = tool_result_message("search", &json!({"q": "x"}), &ToolResult::ok(json!([1])));
        assert!(msg.content.starts_with("<sentra-result tool=\"search\">"));
        assert!(msg.content.contains("\"q\":\"x\""));
    }

    #[test]
    fn test_result_group_keeps_order_and_marks_missing() {
        let mut trace = crate::orchestrator::trace::ToolTrace::new();
        trace.record_result("b", json!({}), crate::agent::OrderingKey::step(1), Some(ToolResult::ok(json!(2))));
        trace.record_invocation("a", json!({}), crate::agent::OrderingKey::step(0));
        let msg = result_group_message(trace.sorted());
        let a = msg.content.find("tool=\"a\"").unwrap();
        let b = msg.content.find("tool=\"b\"").unwrap();
        assert!(a < b);
        assert!(msg.content.contains("NO_RESULT"));
        assert!(msg.content.ends_with("</sentra-result-group>"));
    }
}
