//! DelayedJob：持久化的延迟执行记录（camelCase JSON）

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{ScheduleDescriptor, ScheduleMode, ToolChoiceStatus, ToolResult};

pub type JobId = String;

/// 任务种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// 工具仍在运行，到点后播报进度
    InProgress,
    /// 计划任务
    Scheduled,
}

impl From<ToolChoiceStatus> for JobKind {
    fn from(status: ToolChoiceStatus) -> Self {
        match status {
            ToolChoiceStatus::InProgress => JobKind::InProgress,
            ToolChoiceStatus::Scheduled => JobKind::Scheduled,
        }
    }
}

impl From<JobKind> for ToolChoiceStatus {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::InProgress => ToolChoiceStatus::InProgress,
            JobKind::Scheduled => ToolChoiceStatus::Scheduled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedJob {
    pub job_id: JobId,
    pub run_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub schedule: Option<ScheduleDescriptor>,
    pub delay_ms: u64,
    /// 触发时间（毫秒时间戳），恒不早于 created_at
    pub fire_at: i64,
    pub created_at: i64,
    #[serde(default)]
    pub reason: String,
    pub kind: JobKind,
    #[serde(default)]
    pub attempt: u32,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub objective: String,
    /// 已执行过工具、只剩播报时携带的结果
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

impl DelayedJob {
    pub fn new(
        kind: JobKind,
        run_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
        delay_ms: u64,
    ) -> Self {
        let created_at = chrono::Utc::now().timestamp_millis();
        Self {
            job_id: new_job_id(),
            run_id: run_id.into(),
            tool_name: tool_name.into(),
            args,
            schedule: None,
            delay_ms,
            fire_at: created_at.saturating_add(delay_ms as i64),
            created_at,
            reason: String::new(),
            kind,
            attempt: 0,
            sender_id: String::new(),
            sender_name: String::new(),
            group_id: None,
            objective: String::new(),
            result: None,
        }
    }

    /// 计划描述带目标时间时以其为准（不早于创建时间）
    pub fn with_schedule(mut self, schedule: ScheduleDescriptor) -> Self {
        if let Some(ts) = schedule.target_ts {
            self.fire_at = ts.max(self.created_at);
            self.delay_ms = (self.fire_at - self.created_at) as u64;
        }
        self.schedule = Some(schedule);
        self
    }

    pub fn with_identity(
        mut self,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        group_id: Option<String>,
    ) -> Self {
        self.sender_id = sender_id.into();
        self.sender_name = sender_name.into();
        self.group_id = group_id;
        self
    }

    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = objective.into();
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn conversation_key(&self) -> String {
        match &self.group_id {
            Some(g) => format!("G:{g}"),
            None => format!("U:{}", self.sender_id),
        }
    }

    /// 到点后真正执行工具的计划任务
    pub fn is_delayed_exec(&self) -> bool {
        self.kind == JobKind::Scheduled
            && self
                .schedule
                .as_ref()
                .is_some_and(|s| s.mode == ScheduleMode::DelayedExec)
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.fire_at <= now_ms
    }

    /// 修正越界的触发时间
    pub fn normalize(&mut self) {
        if self.fire_at < self.created_at {
            self.fire_at = self.created_at;
        }
    }

    /// 播报失败后的重排：新 id、attempt + 1，可携带已得到的工具结果
    pub fn rescheduled(&self, backoff_ms: u64, now_ms: i64, result: Option<ToolResult>) -> Self {
        Self {
            job_id: new_job_id(),
            delay_ms: backoff_ms,
            created_at: now_ms,
            fire_at: now_ms.saturating_add(backoff_ms as i64),
            attempt: self.attempt + 1,
            result: result.or_else(|| self.result.clone()),
            ..self.clone()
        }
    }
}

fn new_job_id() -> JobId {
    format!("job_{}", uuid::Uuid::new_v4())
}
