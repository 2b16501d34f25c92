//! Agent Stream 事件：规划/工具执行智能体在一个回合内推送的强类型事件
//!
//! JSON 以 `type` 字段区分事件种类，字段为 camelCase；未知种类反序列化为 Unknown，编排器忽略之。

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具执行结果；失败同样以结构化形式返回，作为证据交还模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            code: "OK".to_string(),
            error: None,
            message: None,
            data,
        }
    }

    pub fn failure(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.into(),
            error: Some(error.into()),
            message: None,
            data: Value::Null,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// 工具调用的排序键；全部缺失时由调用方的序号兜底
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderingKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl OrderingKey {
    pub fn step(step_index: usize) -> Self {
        Self {
            step_index: Some(step_index),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plan_step_index.is_none()
            && self.step_index.is_none()
            && self.exec_index.is_none()
            && self.step_id.is_none()
    }

    /// 去重用的判别串：稳定 step id 优先，其次 step / plan step / exec 索引
    pub fn discriminator(&self) -> Option<String> {
        if let Some(id) = &self.step_id {
            return Some(format!("id:{id}"));
        }
        if let Some(s) = self.step_index {
            return Some(format!("step:{s}"));
        }
        if let Some(p) = self.plan_step_index {
            return Some(format!("plan:{p}"));
        }
        self.exec_index.map(|e| format!("exec:{e}"))
    }

    /// 补齐缺失的字段（同一调用的后续事件往往带更多索引）
    pub fn merge_from(&mut self, other: &OrderingKey) {
        if self.plan_step_index.is_none() {
            self.plan_step_index = other.plan_step_index;
        }
        if self.step_index.is_none() {
            self.step_index = other.step_index;
        }
        if self.exec_index.is_none() {
            self.exec_index = other.exec_index;
        }
        if self.step_id.is_none() {
            self.step_id = other.step_id.clone();
        }
    }

    /// 排序：plan step → step → exec，缺失值排在后面
    pub fn sort_cmp(&self, other: &OrderingKey) -> Ordering {
        fn cmp_opt(a: Option<usize>, b: Option<usize>) -> Ordering {
            match (a, b) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        }
        cmp_opt(self.plan_step_index, other.plan_step_index)
            .then_with(|| cmp_opt(self.step_index, other.step_index))
            .then_with(|| cmp_opt(self.exec_index, other.exec_index))
    }
}

/// 结果事件种类：终态结果或进度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    #[default]
    Result,
    Progress,
}

/// 单个工具结果事件；result 为空表示只声明了调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEvent {
    #[serde(flatten)]
    pub ordering: OrderingKey,
    pub tool_name: String,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub result: Option<ToolResult>,
    #[serde(default)]
    pub kind: ResultKind,
}

/// 规划步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub tool_name: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub step_id: Option<String>,
}

/// 参数事件的单项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgsItem {
    pub step_index: usize,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

/// tool_choice 的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceStatus {
    InProgress,
    Scheduled,
}

/// 计划任务模式：到点只播报确认 / 到点真正执行
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleMode {
    #[default]
    #[serde(rename = "scheduled_ack", alias = "scheduled-ack")]
    ScheduledAck,
    #[serde(rename = "delayed_exec", alias = "delayed-exec")]
    DelayedExec,
}

/// 计划描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDescriptor {
    /// 目标时间（毫秒时间戳）
    #[serde(default)]
    pub target_ts: Option<i64>,
    #[serde(default)]
    pub timezone: Option<String>,
    /// 人类可读的计划描述，如「明早 8 点」
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub mode: ScheduleMode,
}

/// 执行统计（completed 事件附带）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSummary {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub succeeded: usize,
    #[serde(default)]
    pub failed: usize,
    /// 工具调用次数达到上限而被截停
    #[serde(default)]
    pub limit_reached: bool,
}

/// Agent Stream 事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    #[serde(rename_all = "camelCase")]
    Start { run_id: String },

    #[serde(rename_all = "camelCase")]
    Judge {
        need: bool,
        #[serde(default)]
        tool_names: Vec<String>,
    },

    Plan { steps: Vec<PlanStep> },

    #[serde(rename_all = "camelCase")]
    Args {
        step_index: usize,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },

    ArgsGroup { items: Vec<ArgsItem> },

    ToolResult(ToolResultEvent),

    ToolResultGroup { events: Vec<ToolResultEvent> },

    #[serde(rename_all = "camelCase")]
    ToolChoice {
        status: ToolChoiceStatus,
        #[serde(default)]
        tool_name: String,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        step_index: Option<usize>,
        #[serde(default)]
        schedule: Option<ScheduleDescriptor>,
        #[serde(default)]
        delay_ms: u64,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Completed {
        run_id: String,
        #[serde(default)]
        exec: ExecSummary,
    },

    Summary { text: String },

    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// 事件名（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Start { .. } => "start",
            AgentEvent::Judge { .. } => "judge",
            AgentEvent::Plan { .. } => "plan",
            AgentEvent::Args { .. } => "args",
            AgentEvent::ArgsGroup { .. } => "args_group",
            AgentEvent::ToolResult(_) => "tool_result",
            AgentEvent::ToolResultGroup { .. } => "tool_result_group",
            AgentEvent::ToolChoice { .. } => "tool_choice",
            AgentEvent::Completed { .. } => "completed",
            AgentEvent::Summary { .. } => "summary",
            AgentEvent::Unknown => "unknown",
        }
    }
}
