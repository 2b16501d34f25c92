//! 审计用转录：工具调用与结果交替排列，每项截断，条数有上限，末尾附最终回复

use serde_json::Value;

use crate::completion::report::ToolCallRecord;
use crate::memory::clip_chars;

#[derive(Debug, Clone)]
pub struct TranscriptLimits {
    /// 最多保留的工具调用数（取最后若干条）
    pub max_calls: usize,
    pub max_entry_chars: usize,
    pub max_final_chars: usize,
}

impl Default for TranscriptLimits {
    fn default() -> Self {
        Self {
            max_calls: 12,
            max_entry_chars: 800,
            max_final_chars: 2_000,
        }
    }
}

fn compact(value: &Value) -> String {
    match value {
        Value::Null => "{}".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn build_transcript(
    objective: &str,
    calls: &[ToolCallRecord],
    final_response: Option<&str>,
    limits: &TranscriptLimits,
) -> String {
    let mut out = format!("## Objective\n{}\n\n## Tool trace\n", clip_chars(objective, limits.max_entry_chars));

    let skipped = calls.len().saturating_sub(limits.max_calls);
    if skipped > 0 {
        out.push_str(&format!("({skipped} earlier tool calls omitted)\n"));
    }
    for (i, call) in calls.iter().enumerate().skip(skipped) {
        let n = i + 1;
        out.push_str(&format!(
            "[invoke #{n}] {} {}\n",
            call.tool_name,
            clip_chars(&compact(&call.args), limits.max_entry_chars)
        ));
        let result = match &call.result {
            Some(r) => serde_json::to_string(r).unwrap_or_default(),
            None => "(no result observed)".to_string(),
        };
        out.push_str(&format!(
            "[result #{n}] {}\n",
            clip_chars(&result, limits.max_entry_chars)
        ));
    }
    if calls.is_empty() {
        out.push_str("(no tools were called)\n");
    }

    out.push_str("\n## Final reply\n");
    match final_response {
        Some(text) if !text.trim().is_empty() => {
            out.push_str(&clip_chars(text, limits.max_final_chars))
        }
        _ => out.push_str("(no reply was sent)"),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{OrderingKey, ToolResult};
    use serde_json::json;

    fn call(i: usize) -> ToolCallRecord {
        ToolCallRecord {
            tool_name: format!("tool{i}"),
            args: json!({"i": i}),
            ordering: OrderingKey::step(i),
            result: (i % 2 == 0).then(|| ToolResult::ok(json!("x".repeat(50)))),
        }
    }

    #[test]
    fn test_alternates_and_bounds() {
        let calls: Vec<_> = (0..5).map(call).collect();
        let limits = TranscriptLimits {
            max_calls: 3,
            max_entry_chars: 20,
            max_final_chars: 5,
        };
        let t = build_transcript("do things", &calls, Some("all finished"), &limits);
        assert!(t.contains("(2 earlier tool calls omitted)"));
        assert!(!t.contains("[invoke #1]"));
        assert!(t.contains("[invoke #3] tool2"));
        assert!(t.contains("[result #4] (no result observed)"));
        assert!(t.contains("...[truncated]"));
        assert!(t.ends_with("all f...[truncated]"));
    }
}
