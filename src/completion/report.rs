//! 完成度报告与存储
//!
//! 报告按 task id 存放（JSON + Markdown），按会话键建索引。恢复次数在存储内原子递增：
//! 首次写入为 0，之后每次 +1，达到上限后拒绝写入。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{OrderingKey, ToolResult};
use crate::completion::verdict::{CompletionStatus, CompletionVerdict, Promise};

/// 报告里的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub ordering: OrderingKey,
    #[serde(default)]
    pub result: Option<ToolResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub task_id: String,
    pub conversation_key: String,
    pub objective: String,
    pub status: CompletionStatus,
    pub confidence: f64,
    pub summary: String,
    pub reason: String,
    pub promises: Vec<Promise>,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub final_response: Option<String>,
    #[serde(default)]
    pub recovery_attempt: u32,
    pub updated_at: i64,
}

impl CompletionReport {
    pub fn new(
        task_id: impl Into<String>,
        conversation_key: impl Into<String>,
        objective: impl Into<String>,
        verdict: &CompletionVerdict,
        tool_calls: Vec<ToolCallRecord>,
        final_response: Option<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            conversation_key: conversation_key.into(),
            objective: objective.into(),
            status: verdict.status,
            confidence: verdict.confidence,
            summary: verdict.summary.clone(),
            reason: verdict.reason.clone(),
            promises: verdict.promises.clone(),
            tool_calls,
            final_response,
            recovery_attempt: 0,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut md = format!(
            "# Completion report `{}`\n\n- Conversation: `{}`\n- Status: **{}** (confidence {:.2})\n- Recovery attempt: {}\n- Updated: {}\n\n## Objective\n\n{}\n",
            self.task_id,
            self.conversation_key,
            self.status.as_str(),
            self.confidence,
            self.recovery_attempt,
            chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.updated_at)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            self.objective,
        );
        if !self.summary.is_empty() {
            md.push_str(&format!("\n## Summary\n\n{}\n", self.summary));
        }
        if !self.reason.is_empty() {
            md.push_str(&format!("\n## Reason\n\n{}\n", self.reason));
        }
        if !self.promises.is_empty() {
            md.push_str("\n## Promises\n\n");
            for p in &self.promises {
                let mark = if p.fulfilled { "x" } else { " " };
                md.push_str(&format!("- [{mark}] {}", p.content));
                if !p.evidence.is_empty() {
                    md.push_str(&format!(" (evidence: {})", p.evidence));
                }
                md.push('\n');
            }
        }
        if !self.tool_calls.is_empty() {
            md.push_str("\n## Tool calls\n\n| # | Tool | Success | Code |\n|---|------|---------|------|\n");
            for (i, c) in self.tool_calls.iter().enumerate() {
                let (ok, code) = match &c.result {
                    Some(r) => (if r.success { "yes" } else { "no" }, r.code.as_str()),
                    None => ("-", "-"),
                };
                md.push_str(&format!("| {} | {} | {ok} | {code} |\n", i + 1, c.tool_name));
            }
        }
        md
    }
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// 写入报告并原子递增恢复次数；已达 `max_attempts` 时不写入并返回 None
    async fn save(&self, report: &CompletionReport, max_attempts: u32) -> anyhow::Result<Option<u32>>;

    async fn get(&self, task_id: &str) -> anyhow::Result<Option<CompletionReport>>;

    async fn remove(&self, task_id: &str) -> anyhow::Result<bool>;

    async fn list_by_conversation(&self, conversation_key: &str) -> anyhow::Result<Vec<CompletionReport>>;
}

#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: Mutex<HashMap<String, (CompletionReport, String)>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (CompletionReport, String)>> {
        self.reports.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn markdown(&self, task_id: &str) -> Option<String> {
        self.lock().get(task_id).map(|(_, md)| md.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn save(&self, report: &CompletionReport, max_attempts: u32) -> anyhow::Result<Option<u32>> {
        let mut reports = self.lock();
        let attempt = match reports.get(&report.task_id) {
            Some((prior, _)) if prior.recovery_attempt >= max_attempts => return Ok(None),
            Some((prior, _)) => prior.recovery_attempt + 1,
            None => 0,
        };
        let mut stored = report.clone();
        stored.recovery_attempt = attempt;
        let md = stored.to_markdown();
        reports.insert(stored.task_id.clone(), (stored, md));
        Ok(Some(attempt))
    }

    async fn get(&self, task_id: &str) -> anyhow::Result<Option<CompletionReport>> {
        Ok(self.lock().get(task_id).map(|(r, _)| r.clone()))
    }

    async fn remove(&self, task_id: &str) -> anyhow::Result<bool> {
        Ok(self.lock().remove(task_id).is_some())
    }

    async fn list_by_conversation(&self, conversation_key: &str) -> anyhow::Result<Vec<CompletionReport>> {
        let mut list: Vec<CompletionReport> = self
            .lock()
            .values()
            .filter(|(r, _)| r.conversation_key == conversation_key)
            .map(|(r, _)| r.clone())
            .collect();
        list.sort_by_key(|r| r.updated_at);
        Ok(list)
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteReportStore;

#[cfg(feature = "async-sqlite")]
mod sqlite {
    use std::path::Path;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use super::{CompletionReport, ReportStore};

    /// SQLite 报告存储；recovery_attempt 列由单条 UPSERT 原子递增
    #[derive(Clone)]
    pub struct SqliteReportStore {
        pool: SqlitePool,
    }

    impl SqliteReportStore {
        pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            let pool = SqlitePoolOptions::new()
                .max_connections(3)
                .connect(&db_url)
                .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS completion_reports (
                    task_id TEXT PRIMARY KEY,
                    conversation_key TEXT NOT NULL,
                    status TEXT NOT NULL,
                    recovery_attempt INTEGER NOT NULL DEFAULT 0,
                    payload TEXT NOT NULL,
                    markdown TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
            )
            .execute(&pool)
            .await?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_reports_conversation ON completion_reports(conversation_key)",
            )
            .execute(&pool)
            .await?;

            Ok(Self { pool })
        }

        fn decode(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<CompletionReport> {
            let payload: String = row.get("payload");
            let mut report: CompletionReport = serde_json::from_str(&payload)?;
            report.recovery_attempt = row.get::<i64, _>("recovery_attempt") as u32;
            Ok(report)
        }

        pub async fn markdown(&self, task_id: &str) -> anyhow::Result<Option<String>> {
            let row = sqlx::query("SELECT markdown FROM completion_reports WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|r| r.get("markdown")))
        }
    }

    #[async_trait]
    impl ReportStore for SqliteReportStore {
        async fn save(&self, report: &CompletionReport, max_attempts: u32) -> anyhow::Result<Option<u32>> {
            let row = sqlx::query(
                "INSERT INTO completion_reports
                    (task_id, conversation_key, status, recovery_attempt, payload, markdown, updated_at)
                 VALUES (?, ?, ?, 0, ?, ?, ?)
                 ON CONFLICT(task_id) DO UPDATE SET
                    recovery_attempt = completion_reports.recovery_attempt + 1,
                    conversation_key = excluded.conversation_key,
                    status = excluded.status,
                    payload = excluded.payload,
                    markdown = excluded.markdown,
                    updated_at = excluded.updated_at
                 WHERE completion_reports.recovery_attempt < ?
                 RETURNING recovery_attempt",
            )
            .bind(&report.task_id)
            .bind(&report.conversation_key)
            .bind(report.status.as_str())
            .bind(serde_json::to_string(report)?)
            .bind(report.to_markdown())
            .bind(report.updated_at)
            .bind(max_attempts as i64)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let attempt = row.get::<i64, _>("recovery_attempt") as u32;
            if attempt > 0 {
                // Markdown 需要反映递增后的次数
                let mut stored = report.clone();
                stored.recovery_attempt = attempt;
                sqlx::query("UPDATE completion_reports SET markdown = ? WHERE task_id = ?")
                    .bind(stored.to_markdown())
                    .bind(&stored.task_id)
                    .execute(&self.pool)
                    .await?;
            }
            Ok(Some(attempt))
        }

        async fn get(&self, task_id: &str) -> anyhow::Result<Option<CompletionReport>> {
            let row = sqlx::query(
                "SELECT payload, recovery_attempt FROM completion_reports WHERE task_id = ?",
            )
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(Self::decode).transpose()
        }

        async fn remove(&self, task_id: &str) -> anyhow::Result<bool> {
            let res = sqlx::query("DELETE FROM completion_reports WHERE task_id = ?")
                .bind(task_id)
                .execute(&self.pool)
                .await?;
            Ok(res.rows_affected() > 0)
        }

        async fn list_by_conversation(&self, conversation_key: &str) -> anyhow::Result<Vec<CompletionReport>> {
            let rows = sqlx::query(
                "SELECT payload, recovery_attempt FROM completion_reports
                 WHERE conversation_key = ? ORDER BY updated_at ASC",
            )
            .bind(conversation_key)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(Self::decode).collect()
        }
    }
}
