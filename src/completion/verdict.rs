//! 完成度判定
//!
//! 审计模型以 JSON 回答，status 限定为 completed | partial | pending；词表之外或无法解析时为 unknown。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Partial,
    Pending,
    Unknown,
}

impl CompletionStatus {
    /// 未完成（需要持久化以便后续恢复）
    pub fn is_incomplete(self) -> bool {
        matches!(self, CompletionStatus::Partial | CompletionStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompletionStatus::Completed => "completed",
            CompletionStatus::Partial => "partial",
            CompletionStatus::Pending => "pending",
            CompletionStatus::Unknown => "unknown",
        }
    }

    /// 审计模型允许给出的状态
    fn from_judge(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "completed" => Some(CompletionStatus::Completed),
            "partial" => Some(CompletionStatus::Partial),
            "pending" => Some(CompletionStatus::Pending),
            _ => None,
        }
    }
}

impl std::str::FromStr for CompletionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unknown" => Ok(CompletionStatus::Unknown),
            other => Self::from_judge(other).ok_or_else(|| format!("invalid completion status: {s}")),
        }
    }
}

/// 回合中许下的承诺
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promise {
    pub content: String,
    #[serde(default)]
    pub fulfilled: bool,
    #[serde(default)]
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionVerdict {
    pub status: CompletionStatus,
    /// [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub promises: Vec<Promise>,
}

impl CompletionVerdict {
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Unknown,
            confidence: 0.0,
            summary: String::new(),
            reason: reason.into(),
            promises: Vec::new(),
        }
    }

    /// 审计不可用时的放行判定
    pub fn fail_open(status: CompletionStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            confidence: if status == CompletionStatus::Completed { 1.0 } else { 0.0 },
            summary: String::new(),
            reason: reason.into(),
            promises: Vec::new(),
        }
    }

    pub fn unfulfilled(&self) -> impl Iterator<Item = &Promise> {
        self.promises.iter().filter(|p| !p.fulfilled)
    }
}

#[derive(Deserialize)]
struct JudgeReply {
    status: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    promises: Vec<Promise>,
}

/// 从审计模型输出中提取 JSON 判定（兼容 ```json 围栏与前后闲聊）
pub fn parse_verdict(raw: &str) -> Option<CompletionVerdict> {
    let trimmed = raw.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end < start {
            return None;
        }
        &trimmed[start..=end]
    };

    let reply: JudgeReply = serde_json::from_str(json_str).ok()?;
    let status = CompletionStatus::from_judge(&reply.status)?;
    Some(CompletionVerdict {
        status,
        confidence: reply.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        summary: reply.summary,
        reason: reply.reason,
        promises: reply.promises,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_verdict() {
        let raw = "Here is my verdict:\n```json\n{\"status\":\"partial\",\"confidence\":1.7,\"summary\":\"half\",\"promises\":[{\"content\":\"send report\",\"fulfilled\":false}]}\n```";
        let v = parse_verdict(raw).unwrap();
        assert_eq!(v.status, CompletionStatus::Partial);
        assert_eq!(v.confidence, 1.0);
        assert_eq!(v.unfulfilled().count(), 1);
    }

    #[test]
    fn test_status_outside_vocabulary_is_rejected() {
        assert!(parse_verdict(r#"{"status":"unknown"}"#).is_none());
        assert!(parse_verdict(r#"{"status":"done"}"#).is_none());
        assert!(parse_verdict("no json at all").is_none());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("Pending".parse::<CompletionStatus>(), Ok(CompletionStatus::Pending));
        assert_eq!("unknown".parse::<CompletionStatus>(), Ok(CompletionStatus::Unknown));
        assert!("nope".parse::<CompletionStatus>().is_err());
    }
}
