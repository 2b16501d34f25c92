//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SENTRA__*` 覆盖（双下划线表示嵌套，如 `SENTRA__PROTOCOL__MAX_RETRIES=5`）。
//! 时间类字段一律以毫秒或秒的整数给出，字段名带单位后缀。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::completion::{CompletionConfig, CompletionStatus, TranscriptLimits};
use crate::jobs::JobsConfig;
use crate::orchestrator::{OrchestratorConfig, PreReplyConfig};
use crate::protocol::ProtocolConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub protocol: ProtocolSection,
    pub orchestrator: OrchestratorSection,
    pub pre_reply: PreReplySection,
    pub jobs: JobsSection,
    pub completion: CompletionSection,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 后端：openai / mock；未设置 OPENAI_API_KEY 时退回 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [protocol] 段：ProtocolChat 的重问、传输重试与格式修复
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    pub max_retries: u32,
    pub transport_retries: u32,
    pub transport_backoff_ms: u64,
    pub format_fix: bool,
    pub max_response_tokens: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        let d = ProtocolConfig::default();
        Self {
            max_retries: d.max_retries,
            transport_retries: d.transport_retries,
            transport_backoff_ms: d.transport_backoff.as_millis() as u64,
            format_fix: d.format_fix,
            max_response_tokens: d.max_response_tokens,
        }
    }
}

impl From<&ProtocolSection> for ProtocolConfig {
    fn from(s: &ProtocolSection) -> Self {
        Self {
            max_retries: s.max_retries.max(1),
            transport_retries: s.transport_retries,
            transport_backoff: Duration::from_millis(s.transport_backoff_ms),
            format_fix: s.format_fix,
            max_response_tokens: s.max_response_tokens,
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub supplement_wait_ms: u64,
    pub incremental_replies: bool,
    pub max_restarts: u32,
    pub retrieval_timeout_ms: u64,
    pub retrieval_ttl_secs: u64,
    pub snapshot_ttl_secs: u64,
    pub history_limit: usize,
    pub tool_limit_reminder: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let d = OrchestratorConfig::default();
        Self {
            supplement_wait_ms: d.supplement_wait.as_millis() as u64,
            incremental_replies: d.incremental_replies,
            max_restarts: d.max_restarts,
            retrieval_timeout_ms: d.retrieval_timeout.as_millis() as u64,
            retrieval_ttl_secs: d.retrieval_ttl.as_secs(),
            snapshot_ttl_secs: d.snapshot_ttl.as_secs(),
            history_limit: d.history_limit,
            tool_limit_reminder: d.tool_limit_reminder,
        }
    }
}

/// [pre_reply] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreReplySection {
    pub enabled: bool,
    pub cooldown_secs: u64,
    pub bypass_tool_count: usize,
    pub low_value_tools: Vec<String>,
}

impl Default for PreReplySection {
    fn default() -> Self {
        let d = PreReplyConfig::default();
        Self {
            enabled: d.enabled,
            cooldown_secs: d.cooldown.as_secs(),
            bypass_tool_count: d.bypass_tool_count,
            low_value_tools: d.low_value_tools,
        }
    }
}

impl From<&PreReplySection> for PreReplyConfig {
    fn from(s: &PreReplySection) -> Self {
        Self {
            enabled: s.enabled,
            cooldown: Duration::from_secs(s.cooldown_secs),
            bypass_tool_count: s.bypass_tool_count,
            low_value_tools: s.low_value_tools.clone(),
        }
    }
}

/// [jobs] 段：持久化路径与 worker 节奏
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    /// SQLite 文件；未设置时只用内存存储
    pub database: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub reschedule_base_ms: u64,
    pub tool_timeout_secs: u64,
}

impl Default for JobsSection {
    fn default() -> Self {
        let d = JobsConfig::default();
        Self {
            database: None,
            poll_interval_ms: d.poll_interval.as_millis() as u64,
            reschedule_base_ms: d.reschedule_base_ms,
            tool_timeout_secs: d.tool_timeout.as_secs(),
        }
    }
}

impl From<&JobsSection> for JobsConfig {
    fn from(s: &JobsSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(s.poll_interval_ms.max(10)),
            reschedule_base_ms: s.reschedule_base_ms,
            tool_timeout: Duration::from_secs(s.tool_timeout_secs),
        }
    }
}

/// [completion] 段：完成度审计
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionSection {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_calls: usize,
    pub max_entry_chars: usize,
    pub max_final_chars: usize,
    pub max_recovery_attempts: u32,
    /// 重试耗尽时的放行状态：completed / partial / pending / unknown
    pub fail_open_status: String,
    /// 报告 SQLite 文件；未设置时只用内存存储
    pub database: Option<PathBuf>,
}

impl Default for CompletionSection {
    fn default() -> Self {
        let d = CompletionConfig::default();
        Self {
            enabled: d.enabled,
            max_retries: d.max_retries,
            retry_backoff_ms: d.retry_backoff.as_millis() as u64,
            max_calls: d.limits.max_calls,
            max_entry_chars: d.limits.max_entry_chars,
            max_final_chars: d.limits.max_final_chars,
            max_recovery_attempts: d.max_recovery_attempts,
            fail_open_status: d.fail_open_status.as_str().to_string(),
            database: None,
        }
    }
}

impl From<&CompletionSection> for CompletionConfig {
    fn from(s: &CompletionSection) -> Self {
        let fail_open_status = s.fail_open_status.parse().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid fail_open_status, using completed");
            CompletionStatus::Completed
        });
        Self {
            enabled: s.enabled,
            max_retries: s.max_retries.max(1),
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
            limits: TranscriptLimits {
                max_calls: s.max_calls,
                max_entry_chars: s.max_entry_chars,
                max_final_chars: s.max_final_chars,
            },
            max_recovery_attempts: s.max_recovery_attempts,
            fail_open_status,
        }
    }
}

impl AppConfig {
    pub fn protocol_config(&self) -> ProtocolConfig {
        (&self.protocol).into()
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let s = &self.orchestrator;
        OrchestratorConfig {
            supplement_wait: Duration::from_millis(s.supplement_wait_ms),
            incremental_replies: s.incremental_replies,
            max_restarts: s.max_restarts,
            retrieval_timeout: Duration::from_millis(s.retrieval_timeout_ms),
            retrieval_ttl: Duration::from_secs(s.retrieval_ttl_secs),
            snapshot_ttl: Duration::from_secs(s.snapshot_ttl_secs),
            history_limit: s.history_limit,
            tool_limit_reminder: s.tool_limit_reminder.clone(),
            pre_reply: (&self.pre_reply).into(),
        }
    }

    pub fn jobs_config(&self) -> JobsConfig {
        (&self.jobs).into()
    }

    pub fn completion_config(&self) -> CompletionConfig {
        (&self.completion).into()
    }
}

/// 从 config 目录加载配置，环境变量 SENTRA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SENTRA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SENTRA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_runtime_configs() {
        let app = AppConfig::default();
        let protocol = app.protocol_config();
        assert_eq!(protocol.max_retries, 3);
        assert_eq!(protocol.transport_backoff, Duration::from_millis(500));
        let orch = app.orchestrator_config();
        assert_eq!(orch.max_restarts, 1);
        assert_eq!(orch.supplement_wait, Duration::from_millis(800));
        let completion = app.completion_config();
        assert_eq!(completion.fail_open_status, CompletionStatus::Completed);
        assert_eq!(completion.max_recovery_attempts, 2);
    }

    #[test]
    fn test_load_explicit_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[protocol]\nmax_retries = 5\n\n[completion]\nfail_open_status = \"partial\"\n\n[pre_reply]\nenabled = true\nlow_value_tools = [\"time\"]"
        )
        .unwrap();
        let app = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(app.protocol.max_retries, 5);
        assert_eq!(app.protocol.transport_retries, 2);
        assert_eq!(app.completion_config().fail_open_status, CompletionStatus::Partial);
        let orch = app.orchestrator_config();
        assert!(orch.pre_reply.enabled);
        assert_eq!(orch.pre_reply.low_value_tools, vec!["time".to_string()]);
    }
}
