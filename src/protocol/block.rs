//! 协议块类型
//!
//! 模型的每次输出必须恰好是一个顶层块：`<sentra-tools>`（工具调用）或 `<sentra-response>`（回复）。
//! 回复块恰好带一个路由目标（群或用户），可含多段文本与资源列表。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::TokenEstimator;

pub const TOOLS_TAG: &str = "sentra-tools";
pub const RESPONSE_TAG: &str = "sentra-response";

/// 只读的系统注入标签，任何块都不得包含
pub const RESERVED_TAGS: &[&str] = &[
    "sentra-result",
    "sentra-result-group",
    "sentra-user-question",
    "sentra-pending-messages",
    "sentra-memory",
    "sentra-rag-context",
];

/// 工具块专属标签
pub const TOOLS_ONLY_TAGS: &[&str] = &["invoke", "parameter"];

/// 回复块专属标签（另有 textN）
pub const RESPONSE_ONLY_TAGS: &[&str] = &[
    "group_id",
    "user_id",
    "resources",
    "resource",
    "type",
    "source",
    "caption",
];

/// 回复的路由目标
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RoutingTarget {
    Group(String),
    User(String),
}

impl RoutingTarget {
    fn to_xml(&self) -> String {
        match self {
            RoutingTarget::Group(id) => format!("<group_id>{}</group_id>", escape_xml(id)),
            RoutingTarget::User(id) => format!("<user_id>{}</user_id>", escape_xml(id)),
        }
    }
}

/// 回复附带的资源（图片、文件、链接等）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// 回复块
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBlock {
    pub target: RoutingTarget,
    pub segments: Vec<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl ResponseBlock {
    pub fn text_only(target: RoutingTarget, text: impl Into<String>) -> Self {
        Self {
            target,
            segments: vec![text.into()],
            resources: Vec::new(),
        }
    }

    /// 各段文本以换行拼接
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn token_count(&self) -> usize {
        TokenEstimator::estimate_all(self.segments.iter().map(String::as_str))
    }

    /// 零文本且无资源：模型选择沉默
    pub fn is_silent(&self) -> bool {
        self.token_count() == 0 && self.resources.is_empty()
    }

    pub fn to_xml(&self) -> String {
        let mut out = format!("<{RESPONSE_TAG}>\n  {}\n", self.target.to_xml());
        for (i, seg) in self.segments.iter().enumerate() {
            out.push_str(&format!("  <text{n}>{}</text{n}>\n", escape_xml(seg), n = i + 1));
        }
        if !self.resources.is_empty() {
            out.push_str("  <resources>\n");
            for r in &self.resources {
                out.push_str(&format!(
                    "    <resource><type>{}</type><source>{}</source>",
                    escape_xml(&r.kind),
                    escape_xml(&r.source)
                ));
                if let Some(c) = &r.caption {
                    out.push_str(&format!("<caption>{}</caption>", escape_xml(c)));
                }
                out.push_str("</resource>\n");
            }
            out.push_str("  </resources>\n");
        }
        out.push_str(&format!("</{RESPONSE_TAG}>"));
        out
    }
}

/// 单个工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub params: Map<String, Value>,
}

/// 工具块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsBlock {
    pub calls: Vec<ToolCall>,
}

impl ToolsBlock {
    pub fn tool_names(&self) -> Vec<String> {
        self.calls.iter().map(|c| c.name.clone()).collect()
    }

    /// 把工具请求改写为自然语言目标（本该回复却输出工具块时，用它重启回合）
    pub fn to_objective(&self, original: &str) -> String {
        let wanted = self
            .calls
            .iter()
            .map(|c| {
                let params = Value::Object(c.params.clone());
                format!("- use `{}` with {}", c.name, params)
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("{original}\n\nThe assistant decided tools are needed to answer:\n{wanted}")
    }

    pub fn to_xml(&self) -> String {
        let mut out = format!("<{TOOLS_TAG}>\n");
        for call in &self.calls {
            out.push_str(&format!("  <invoke name=\"{}\">\n", escape_xml(&call.name)));
            for (k, v) in &call.params {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push_str(&format!(
                    "    <parameter name=\"{}\">{}</parameter>\n",
                    escape_xml(k),
                    escape_xml(&rendered)
                ));
            }
            out.push_str("  </invoke>\n");
        }
        out.push_str(&format!("</{TOOLS_TAG}>"));
        out
    }
}

/// 一次模型调用解析后的结果：二者恰居其一
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolResponse {
    Tools(ToolsBlock),
    Response(ResponseBlock),
}

impl ProtocolResponse {
    pub fn as_response(&self) -> Option<&ResponseBlock> {
        match self {
            ProtocolResponse::Response(r) => Some(r),
            ProtocolResponse::Tools(_) => None,
        }
    }

    pub fn kind(&self) -> BlockKind {
        match self {
            ProtocolResponse::Tools(_) => BlockKind::Tools,
            ProtocolResponse::Response(_) => BlockKind::Response,
        }
    }
}

/// 块种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Tools,
    Response,
}

impl BlockKind {
    pub fn tag(self) -> &'static str {
        match self {
            BlockKind::Tools => TOOLS_TAG,
            BlockKind::Response => RESPONSE_TAG,
        }
    }
}

/// 调用方期望的输出种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedOutput {
    Response,
    Tools,
    Either,
}

impl ExpectedOutput {
    pub fn accepts(self, kind: BlockKind) -> bool {
        matches!(
            (self, kind),
            (ExpectedOutput::Either, _)
                | (ExpectedOutput::Response, BlockKind::Response)
                | (ExpectedOutput::Tools, BlockKind::Tools)
        )
    }

    pub fn describe(self) -> &'static str {
        match self {
            ExpectedOutput::Response => RESPONSE_TAG,
            ExpectedOutput::Tools => TOOLS_TAG,
            ExpectedOutput::Either => "sentra-tools|sentra-response",
        }
    }
}

pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_response() {
        let block = ResponseBlock {
            target: RoutingTarget::User("1".into()),
            segments: vec!["  ".into()],
            resources: vec![],
        };
        assert!(block.is_silent());
        assert_eq!(block.text(), "");
    }

    #[test]
    fn test_resource_makes_reply_non_silent() {
        let block = ResponseBlock {
            target: RoutingTarget::Group("9".into()),
            segments: vec![],
            resources: vec![Resource {
                kind: "image".into(),
                source: "https://x/y.png".into(),
                caption: None,
            }],
        };
        assert!(!block.is_silent());
        assert!(block.to_xml().contains("<type>image</type>"));
    }

    #[test]
    fn test_objective_mentions_tools() {
        let mut params = Map::new();
        params.insert("q".into(), Value::String("rust".into()));
        let block = ToolsBlock {
            calls: vec![ToolCall {
                name: "search".into(),
                params,
            }],
        };
        let objective = block.to_objective("find rust news");
        assert!(objective.starts_with("find rust news"));
        assert!(objective.contains("`search`"));
    }
}
