//! 工具调用轨迹：有序、去重
//!
//! 去重键为（工具名，规范化参数，排序判别串）；没有任何排序键时用序号兜底。声明调用（args 事件）与随后
//! 的结果事件合并为同一条目。每个条目带 reported 标记，用于判断增量回复是否已覆盖全部结果。

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::agent::{OrderingKey, ToolResult};
use crate::completion::ToolCallRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSource {
    /// 只见到声明（参数），尚无结果
    Invocation,
    Result,
}

#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub tool_name: String,
    pub args: Value,
    pub ordering: OrderingKey,
    pub result: Option<ToolResult>,
    pub source: TraceSource,
    pub seq: u64,
    pub reported: bool,
}

impl TraceEntry {
    pub fn to_record(&self) -> ToolCallRecord {
        ToolCallRecord {
            tool_name: self.tool_name.clone(),
            args: self.args.clone(),
            ordering: self.ordering.clone(),
            result: self.result.clone(),
        }
    }
}

/// 递归按键排序，使参数比较与键顺序无关
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_args(args: &Value) -> String {
    match args {
        Value::Null => "{}".to_string(),
        other => canonicalize(other).to_string(),
    }
}

/// 双方都有的字段必须相等
fn compatible(a: &OrderingKey, b: &OrderingKey) -> bool {
    fn same<T: PartialEq>(x: &Option<T>, y: &Option<T>) -> bool {
        match (x, y) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        }
    }
    same(&a.plan_step_index, &b.plan_step_index)
        && same(&a.step_index, &b.step_index)
        && same(&a.exec_index, &b.exec_index)
        && same(&a.step_id, &b.step_id)
}

#[derive(Debug, Default)]
pub struct ToolTrace {
    entries: Vec<TraceEntry>,
    index: HashMap<String, usize>,
    seq: u64,
}

impl ToolTrace {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tool: &str, args: &str, ordering: &OrderingKey) -> Option<String> {
        ordering
            .discriminator()
            .map(|d| format!("{tool}\u{1f}{args}\u{1f}{d}"))
    }

    /// 同工具同参数、尚无结果、排序键兼容的声明条目
    fn find_pending(&self, tool: &str, args: &str, ordering: &OrderingKey) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.result.is_none()
                && e.tool_name == tool
                && canonical_args(&e.args) == args
                && compatible(&e.ordering, ordering)
        })
    }

    fn push(&mut self, tool: &str, args: Value, ordering: OrderingKey, result: Option<ToolResult>) -> usize {
        self.seq += 1;
        let source = if result.is_some() {
            TraceSource::Result
        } else {
            TraceSource::Invocation
        };
        self.entries.push(TraceEntry {
            tool_name: tool.to_string(),
            args,
            ordering,
            result,
            source,
            seq: self.seq,
            reported: false,
        });
        self.entries.len() - 1
    }

    fn reindex(&mut self, idx: usize) {
        let entry = &self.entries[idx];
        if let Some(key) = Self::key(&entry.tool_name, &canonical_args(&entry.args), &entry.ordering) {
            self.index.insert(key, idx);
        }
    }

    /// 记录声明的调用；已存在时返回 false
    pub fn record_invocation(&mut self, tool: &str, args: Value, ordering: OrderingKey) -> bool {
        let canon = canonical_args(&args);
        if let Some(key) = Self::key(tool, &canon, &ordering) {
            if let Some(&idx) = self.index.get(&key) {
                self.entries[idx].ordering.merge_from(&ordering);
                return false;
            }
        }
        let idx = self.push(tool, args, ordering, None);
        self.reindex(idx);
        true
    }

    /// 记录结果；与已有条目重复时返回 false（已有结果的条目不会被覆盖）
    pub fn record_result(
        &mut self,
        tool: &str,
        args: Value,
        ordering: OrderingKey,
        result: Option<ToolResult>,
    ) -> bool {
        let canon = canonical_args(&args);
        let existing = Self::key(tool, &canon, &ordering)
            .and_then(|key| self.index.get(&key).copied())
            .or_else(|| self.find_pending(tool, &canon, &ordering));

        match existing {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                entry.ordering.merge_from(&ordering);
                let upgraded = entry.result.is_none() && result.is_some();
                if upgraded {
                    entry.result = result;
                    entry.source = TraceSource::Result;
                    entry.reported = false;
                }
                self.reindex(idx);
                upgraded
            }
            None => {
                let idx = self.push(tool, args, ordering, result);
                self.reindex(idx);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按排序键排序，键相同按到达顺序
    pub fn sorted(&self) -> Vec<&TraceEntry> {
        let mut sorted: Vec<&TraceEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.ordering.sort_cmp(&b.ordering).then(a.seq.cmp(&b.seq)));
        sorted
    }

    pub fn records(&self) -> Vec<ToolCallRecord> {
        self.sorted().into_iter().map(TraceEntry::to_record).collect()
    }

    /// 有结果但尚未被回复覆盖的条目（已排序）
    pub fn unreported(&self) -> Vec<&TraceEntry> {
        self.sorted()
            .into_iter()
            .filter(|e| e.result.is_some() && !e.reported)
            .collect()
    }

    pub fn mark_all_reported(&mut self) {
        for e in self.entries.iter_mut().filter(|e| e.result.is_some()) {
            e.reported = true;
        }
    }

    pub fn has_results(&self) -> bool {
        self.entries.iter().any(|e| e.result.is_some())
    }

    /// 所有结果都已被回复覆盖
    pub fn all_reported(&self) -> bool {
        self.has_results() && self.unreported().is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_results_collapse() {
        let mut trace = ToolTrace::new();
        let ordering = OrderingKey {
            plan_step_index: Some(0),
            step_index: Some(0),
            ..Default::default()
        };
        for _ in 0..3 {
            trace.record_result("search", json!({"q": "x"}), ordering.clone(), Some(ToolResult::ok(json!(1))));
        }
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn test_invocation_upgraded_by_result() {
        let mut trace = ToolTrace::new();
        assert!(trace.record_invocation("search", json!({"q": "x", "n": 1}), OrderingKey::step(2)));
        let ordering = OrderingKey {
            step_index: Some(2),
            step_id: Some("s-2".into()),
            ..Default::default()
        };
        assert!(trace.record_result("search", json!({"n": 1, "q": "x"}), ordering, Some(ToolResult::ok(json!([])))));
        assert_eq!(trace.len(), 1);
        let sorted = trace.sorted();
        let entry = sorted[0];
        assert_eq!(entry.source, TraceSource::Result);
        assert_eq!(entry.ordering.step_id.as_deref(), Some("s-2"));
    }

    #[test]
    fn test_without_ordering_uses_sequence() {
        let mut trace = ToolTrace::new();
        trace.record_result("ping", Value::Null, OrderingKey::default(), Some(ToolResult::ok(json!(1))));
        trace.record_result("ping", Value::Null, OrderingKey::default(), Some(ToolResult::ok(json!(2))));
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn test_sorted_by_ordering_then_arrival() {
        let mut trace = ToolTrace::new();
        trace.record_result("b", json!({}), OrderingKey::step(1), Some(ToolResult::ok(json!(1))));
        trace.record_result("a", json!({}), OrderingKey::step(0), Some(ToolResult::ok(json!(0))));
        trace.record_result("c", json!({}), OrderingKey::default(), Some(ToolResult::ok(json!(2))));
        let names: Vec<_> = trace.sorted().iter().map(|e| e.tool_name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_reported_tracking() {
        let mut trace = ToolTrace::new();
        trace.record_invocation("a", json!({}), OrderingKey::step(0));
        assert!(!trace.all_reported());
        trace.record_result("a", json!({}), OrderingKey::step(0), Some(ToolResult::ok(json!(0))));
        assert_eq!(trace.unreported().len(), 1);
        trace.mark_all_reported();
        assert!(trace.all_reported());
        trace.record_result("b", json!({}), OrderingKey::step(1), Some(ToolResult::ok(json!(1))));
        assert!(!trace.all_reported());
    }
}
