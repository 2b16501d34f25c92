//! ProtocolBlockValidator：按结构化输出语法解析并校验模型原始文本
//!
//! 接受条件：整段输出恰好是一个期望种类的顶层块，不含保留标签或另一种块的专属标签，
//! 回复块（归一化后）恰有一个路由目标。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::memory::TokenBudget;
use crate::protocol::block::{
    unescape_xml, BlockKind, ExpectedOutput, ProtocolResponse, Resource, ResponseBlock,
    RoutingTarget, ToolCall, ToolsBlock, RESERVED_TAGS, RESPONSE_ONLY_TAGS, RESPONSE_TAG,
    TOOLS_ONLY_TAGS, TOOLS_TAG,
};

/// 协议违规原因；以类型化值返回，从不作为错误抛出
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Empty,
    NoBlock,
    MultipleBlocks(usize),
    Unclosed(&'static str),
    OutsideContent,
    /// 回复块内除目标、文本段、资源外的残留内容
    StrayContent,
    UnexpectedKind {
        expected: ExpectedOutput,
        found: BlockKind,
    },
    ToolsOnly,
    ReservedTag(String),
    ForeignTag {
        block: BlockKind,
        tag: String,
    },
    MissingTarget,
    MultipleTargets(usize),
    EmptyTools,
    MalformedInvoke,
    MalformedResource,
    TokenBudget {
        tokens: usize,
        max: usize,
    },
}

impl Violation {
    /// 机器可读原因（写入 ChatOutcome.reason 与提醒消息）
    pub fn reason(&self) -> String {
        match self {
            Violation::Empty => "empty_output".into(),
            Violation::NoBlock => "no_protocol_block".into(),
            Violation::MultipleBlocks(n) => format!("multiple_blocks:{n}"),
            Violation::Unclosed(tag) => format!("unclosed_block:{tag}"),
            Violation::OutsideContent => "content_outside_block".into(),
            Violation::StrayContent => "stray_content_in_response".into(),
            Violation::UnexpectedKind { expected, found } => {
                format!("unexpected_block:{}!={}", found.tag(), expected.describe())
            }
            Violation::ToolsOnly => "tools_only_output".into(),
            Violation::ReservedTag(tag) => format!("reserved_tag:{tag}"),
            Violation::ForeignTag { block, tag } => format!("foreign_tag:{tag}_in_{}", block.tag()),
            Violation::MissingTarget => "missing_target".into(),
            Violation::MultipleTargets(n) => format!("multiple_targets:{n}"),
            Violation::EmptyTools => "empty_tools_block".into(),
            Violation::MalformedInvoke => "malformed_invoke".into(),
            Violation::MalformedResource => "malformed_resource".into(),
            Violation::TokenBudget { tokens, max } => format!("token_budget:{tokens}>{max}"),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason())
    }
}

/// 校验结果
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid(ProtocolResponse),
    /// 期望回复却只得到工具块
    ToolsOnly(ToolsBlock),
    Invalid(Violation),
}

/// 协议块校验器
#[derive(Debug, Clone, Default)]
pub struct ProtocolBlockValidator {
    /// 回复块缺少路由目标时用于归一化
    pub default_target: Option<RoutingTarget>,
    pub budget: Option<TokenBudget>,
}

fn block_open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<\s*(sentra-tools|sentra-response)\s*>").unwrap())
}

fn tag_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<\s*/?\s*([A-Za-z_][\w-]*)").unwrap())
}

fn invoke_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)<invoke\s+name\s*=\s*"([^"]*)"\s*>(.*?)</invoke>"#).unwrap())
}

fn parameter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<parameter\s+name\s*=\s*"([^"]*)"\s*>(.*?)</parameter>"#).unwrap()
    })
}

fn target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<(group_id|user_id)>(.*?)</(?:group_id|user_id)>").unwrap())
}

fn text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<text(\d+)>(.*?)</text(\d+)>").unwrap())
}

fn resource_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<resource>(.*?)</resource>").unwrap())
}

fn resources_wrapper_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"</?resources\s*>").unwrap())
}

fn field(inner: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = inner.find(&open)? + open.len();
    let end = inner[start..].find(&close)? + start;
    let value = unescape_xml(inner[start..end].trim());
    (!value.is_empty()).then_some(value)
}

fn parse_param_value(raw: &str) -> Value {
    let text = unescape_xml(raw.trim());
    match serde_json::from_str::<Value>(&text) {
        Ok(v @ (Value::Object(_) | Value::Array(_) | Value::Bool(_) | Value::Number(_))) => v,
        _ => Value::String(text),
    }
}

fn is_text_tag(name: &str) -> bool {
    name.strip_prefix("text")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// 文本中出现的保留标签（开或闭）
pub fn find_reserved_tag(raw: &str) -> Option<String> {
    tag_name_re()
        .captures_iter(raw)
        .map(|c| c[1].to_string())
        .find(|name| RESERVED_TAGS.contains(&name.as_str()))
}

impl ProtocolBlockValidator {
    pub fn new(default_target: Option<RoutingTarget>, budget: Option<TokenBudget>) -> Self {
        Self {
            default_target,
            budget,
        }
    }

    pub fn validate(&self, raw: &str, expected: ExpectedOutput) -> Validation {
        match self.parse(raw) {
            Ok(ProtocolResponse::Tools(block)) if expected == ExpectedOutput::Response => {
                Validation::ToolsOnly(block)
            }
            Ok(resp) if !expected.accepts(resp.kind()) => Validation::Invalid(Violation::UnexpectedKind {
                expected,
                found: resp.kind(),
            }),
            Ok(resp) => Validation::Valid(resp),
            Err(v) => Validation::Invalid(v),
        }
    }

    /// 解析出唯一顶层块（不考虑期望种类）
    pub fn parse(&self, raw: &str) -> Result<ProtocolResponse, Violation> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(Violation::Empty);
        }
        if let Some(tag) = find_reserved_tag(text) {
            return Err(Violation::ReservedTag(tag));
        }

        let opens: Vec<_> = block_open_re().captures_iter(text).collect();
        let kind = match opens.len() {
            0 => return Err(Violation::NoBlock),
            1 if opens[0][1] == *TOOLS_TAG => BlockKind::Tools,
            1 => BlockKind::Response,
            n => return Err(Violation::MultipleBlocks(n)),
        };

        let tag = kind.tag();
        let open_match = opens[0].get(0).ok_or(Violation::NoBlock)?;
        let close = format!("</{tag}>");
        let close_at = text.rfind(&close).ok_or(Violation::Unclosed(tag))?;
        if close_at < open_match.end() {
            return Err(Violation::Unclosed(tag));
        }
        if open_match.start() != 0 || close_at + close.len() != text.len() {
            return Err(Violation::OutsideContent);
        }
        let inner = &text[open_match.end()..close_at];

        match kind {
            BlockKind::Tools => self.parse_tools(inner).map(ProtocolResponse::Tools),
            BlockKind::Response => self.parse_response(inner).map(ProtocolResponse::Response),
        }
    }

    fn parse_tools(&self, inner: &str) -> Result<ToolsBlock, Violation> {
        for cap in tag_name_re().captures_iter(inner) {
            let name = &cap[1];
            if RESPONSE_ONLY_TAGS.contains(&name) || is_text_tag(name) {
                return Err(Violation::ForeignTag {
                    block: BlockKind::Tools,
                    tag: name.to_string(),
                });
            }
        }

        let mut calls = Vec::new();
        for cap in invoke_re().captures_iter(inner) {
            let name = unescape_xml(cap[1].trim());
            if name.is_empty() {
                return Err(Violation::MalformedInvoke);
            }
            let body = &cap[2];
            let mut params = Map::new();
            for p in parameter_re().captures_iter(body) {
                params.insert(unescape_xml(p[1].trim()), parse_param_value(&p[2]));
            }
            if !parameter_re().replace_all(body, "").trim().is_empty() {
                return Err(Violation::MalformedInvoke);
            }
            calls.push(ToolCall { name, params });
        }

        if !invoke_re().replace_all(inner, "").trim().is_empty() {
            return Err(Violation::MalformedInvoke);
        }
        if calls.is_empty() {
            return Err(Violation::EmptyTools);
        }
        Ok(ToolsBlock { calls })
    }

    fn parse_response(&self, inner: &str) -> Result<ResponseBlock, Violation> {
        for cap in tag_name_re().captures_iter(inner) {
            let name = &cap[1];
            if TOOLS_ONLY_TAGS.contains(&name) {
                return Err(Violation::ForeignTag {
                    block: BlockKind::Response,
                    tag: name.to_string(),
                });
            }
        }

        let targets: Vec<RoutingTarget> = target_re()
            .captures_iter(inner)
            .map(|c| {
                let id = unescape_xml(c[2].trim());
                if &c[1] == "group_id" {
                    RoutingTarget::Group(id)
                } else {
                    RoutingTarget::User(id)
                }
            })
            .collect();
        let target = match targets.len() {
            0 => self.default_target.clone().ok_or(Violation::MissingTarget)?,
            1 => targets.into_iter().next().ok_or(Violation::MissingTarget)?,
            n => return Err(Violation::MultipleTargets(n)),
        };
        let target_id = match &target {
            RoutingTarget::Group(id) | RoutingTarget::User(id) => id,
        };
        if target_id.is_empty() {
            return Err(Violation::MissingTarget);
        }

        let mut numbered: Vec<(u32, String)> = Vec::new();
        for cap in text_re().captures_iter(inner) {
            if cap[1] != cap[3] {
                return Err(Violation::Unclosed("textN"));
            }
            let n = cap[1].parse::<u32>().unwrap_or(u32::MAX);
            numbered.push((n, unescape_xml(cap[2].trim())));
        }
        numbered.sort_by_key(|(n, _)| *n);
        let segments: Vec<String> = numbered.into_iter().map(|(_, s)| s).collect();

        let mut resources = Vec::new();
        for cap in resource_re().captures_iter(inner) {
            let body = &cap[1];
            let (Some(kind), Some(source)) = (field(body, "type"), field(body, "source")) else {
                return Err(Violation::MalformedResource);
            };
            resources.push(Resource {
                kind,
                source,
                caption: field(body, "caption"),
            });
        }

        let rest = target_re().replace_all(inner, "");
        let rest = text_re().replace_all(&rest, "");
        let rest = resource_re().replace_all(&rest, "");
        if !resources_wrapper_re().replace_all(&rest, "").trim().is_empty() {
            return Err(Violation::StrayContent);
        }

        let block = ResponseBlock {
            target,
            segments,
            resources,
        };
        if let Some(budget) = self.budget {
            let tokens = block.token_count();
            if budget.exceeded_by(tokens) {
                return Err(Violation::TokenBudget {
                    tokens,
                    max: budget.max_tokens,
                });
            }
        }
        Ok(block)
    }
}

/// 期望种类对应的提醒文本（追加在对话末尾后重试）
pub fn violation_reminder(violation: &Violation, expected: ExpectedOutput) -> String {
    let shape = match expected {
        ExpectedOutput::Response => format!(
            "exactly one <{RESPONSE_TAG}> block with one <group_id> or <user_id> and <text1>..."
        ),
        ExpectedOutput::Tools => format!(
            "exactly one <{TOOLS_TAG}> block of <invoke name=\"...\"><parameter name=\"...\">"
        ),
        ExpectedOutput::Either => format!("exactly one <{TOOLS_TAG}> or <{RESPONSE_TAG}> block"),
    };
    format!(
        "<protocol-violation reason=\"{}\">Your previous output broke the output protocol. Reply again with {shape} and nothing outside it.</protocol-violation>",
        violation.reason()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ProtocolBlockValidator {
        ProtocolBlockValidator::default()
    }

    #[test]
    fn test_valid_response_block() {
        let raw = "<sentra-response>\n<user_id>42</user_id>\n<text2>world</text2><text1>hello</text1>\n</sentra-response>";
        match validator().validate(raw, ExpectedOutput::Response) {
            Validation::Valid(ProtocolResponse::Response(block)) => {
                assert_eq!(block.target, RoutingTarget::User("42".into()));
                assert_eq!(block.segments, vec!["hello", "world"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_valid_tools_block_parses_params() {
        let raw = r#"<sentra-tools><invoke name="search"><parameter name="q">rust &amp; tokio</parameter><parameter name="limit">5</parameter></invoke></sentra-tools>"#;
        match validator().validate(raw, ExpectedOutput::Tools) {
            Validation::Valid(ProtocolResponse::Tools(block)) => {
                assert_eq!(block.calls.len(), 1);
                assert_eq!(block.calls[0].params["q"], "rust & tokio");
                assert_eq!(block.calls[0].params["limit"], 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tools_only_when_response_expected() {
        let raw = r#"<sentra-tools><invoke name="weather"></invoke></sentra-tools>"#;
        assert!(matches!(
            validator().validate(raw, ExpectedOutput::Response),
            Validation::ToolsOnly(_)
        ));
    }

    #[test]
    fn test_rejects_two_blocks() {
        let raw = "<sentra-response><user_id>1</user_id><text1>a</text1></sentra-response><sentra-response><user_id>1</user_id><text1>b</text1></sentra-response>";
        assert_eq!(
            validator().validate(raw, ExpectedOutput::Response),
            Validation::Invalid(Violation::MultipleBlocks(2))
        );
    }

    #[test]
    fn test_rejects_mixed_blocks() {
        let raw = r#"<sentra-response><user_id>1</user_id><text1>a</text1><sentra-tools><invoke name="x"></invoke></sentra-tools></sentra-response>"#;
        assert!(matches!(
            validator().validate(raw, ExpectedOutput::Either),
            Validation::Invalid(Violation::MultipleBlocks(2))
        ));
    }

    #[test]
    fn test_rejects_reserved_tag() {
        let raw = "<sentra-response><user_id>1</user_id><text1>a</text1><sentra-result>x</sentra-result></sentra-response>";
        assert_eq!(
            validator().validate(raw, ExpectedOutput::Response),
            Validation::Invalid(Violation::ReservedTag("sentra-result".into()))
        );
    }

    #[test]
    fn test_rejects_foreign_tag_in_response() {
        let raw = r#"<sentra-response><user_id>1</user_id><text1>a</text1><invoke name="x"></invoke></sentra-response>"#;
        assert!(matches!(
            validator().validate(raw, ExpectedOutput::Response),
            Validation::Invalid(Violation::ForeignTag { .. })
        ));
    }

    #[test]
    fn test_rejects_text_tag_in_tools() {
        let raw = r#"<sentra-tools><invoke name="x"></invoke><text1>hi</text1></sentra-tools>"#;
        assert!(matches!(
            validator().validate(raw, ExpectedOutput::Tools),
            Validation::Invalid(Violation::ForeignTag { .. })
        ));
    }

    #[test]
    fn test_target_rules() {
        let both = "<sentra-response><user_id>1</user_id><group_id>2</group_id><text1>a</text1></sentra-response>";
        assert_eq!(
            validator().validate(both, ExpectedOutput::Response),
            Validation::Invalid(Violation::MultipleTargets(2))
        );

        let none = "<sentra-response><text1>a</text1></sentra-response>";
        assert_eq!(
            validator().validate(none, ExpectedOutput::Response),
            Validation::Invalid(Violation::MissingTarget)
        );

        let normalized = ProtocolBlockValidator::new(Some(RoutingTarget::Group("g".into())), None);
        match normalized.validate(none, ExpectedOutput::Response) {
            Validation::Valid(ProtocolResponse::Response(block)) => {
                assert_eq!(block.target, RoutingTarget::Group("g".into()))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejects_chatter_outside_block() {
        let raw = "Sure! <sentra-response><user_id>1</user_id><text1>a</text1></sentra-response>";
        assert_eq!(
            validator().validate(raw, ExpectedOutput::Response),
            Validation::Invalid(Violation::OutsideContent)
        );
    }

    #[test]
    fn test_rejects_stray_content_in_response() {
        let stray_text = "<sentra-response><user_id>1</user_id>oops<text1>a</text1></sentra-response>";
        assert_eq!(
            validator().validate(stray_text, ExpectedOutput::Response),
            Validation::Invalid(Violation::StrayContent)
        );
        let unknown_tag =
            "<sentra-response><user_id>1</user_id><mood>happy</mood><text1>a</text1></sentra-response>";
        assert_eq!(
            validator().validate(unknown_tag, ExpectedOutput::Response),
            Validation::Invalid(Violation::StrayContent)
        );
        let with_resources = "<sentra-response><user_id>1</user_id><text1>a</text1>\n<resources>\n<resource><type>image</type><source>a.png</source></resource>\n</resources>\n</sentra-response>";
        assert!(matches!(
            validator().validate(with_resources, ExpectedOutput::Response),
            Validation::Valid(ProtocolResponse::Response(_))
        ));
    }

    #[test]
    fn test_token_budget_violation() {
        let v = ProtocolBlockValidator::new(None, Some(TokenBudget::new(2)));
        let raw = "<sentra-response><user_id>1</user_id><text1>this sentence is definitely too long</text1></sentra-response>";
        assert!(matches!(
            v.validate(raw, ExpectedOutput::Response),
            Validation::Invalid(Violation::TokenBudget { max: 2, .. })
        ));
    }

    #[test]
    fn test_plain_text_has_no_block() {
        assert_eq!(
            validator().validate("just text", ExpectedOutput::Response),
            Validation::Invalid(Violation::NoBlock)
        );
        assert_eq!(
            validator().validate("   ", ExpectedOutput::Response),
            Validation::Invalid(Violation::Empty)
        );
    }
}
