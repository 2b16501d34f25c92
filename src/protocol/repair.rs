//! 确定性兜底修复
//!
//! 重试耗尽后才运行：去掉代码围栏与块外闲聊，删除保留标签，抽取期望种类的第一个块并补齐闭合标签；
//! 期望回复且已知默认目标时，把裸文本包装为回复块。每一步后都重新校验，成功即返回。

use std::sync::OnceLock;

use regex::Regex;

use crate::protocol::block::{
    ExpectedOutput, ProtocolResponse, ResponseBlock, RESERVED_TAGS, RESPONSE_TAG,
    TOOLS_TAG,
};
use crate::protocol::validator::{ProtocolBlockValidator, Validation, Violation};

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*```[\w-]*\s*$").unwrap())
}

fn reserved_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        RESERVED_TAGS
            .iter()
            .flat_map(|tag| {
                let t = regex::escape(tag);
                [
                    Regex::new(&format!(r"(?s)<\s*{t}\b[^>]*>.*?<\s*/\s*{t}\s*>")).unwrap(),
                    Regex::new(&format!(r"<\s*/?\s*{t}\b[^>]*/?>")).unwrap(),
                ]
            })
            .collect()
    })
}

fn any_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"</?[A-Za-z_][\w-]*(?:\s[^>]*)?/?>").unwrap())
}

pub fn strip_fences(raw: &str) -> String {
    fence_re().replace_all(raw, "").trim().to_string()
}

pub fn strip_reserved(raw: &str) -> String {
    let mut out = raw.to_string();
    for re in reserved_res() {
        out = re.replace_all(&out, "").into_owned();
    }
    out
}

/// 抽取第一个 `<tag>` 块；缺少闭合标签时在下一个顶层块之前补齐
pub fn extract_block(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)?;
    let rest = &text[start..];
    let tail = &rest[open.len()..];
    if let Some(end) = tail.find(&close) {
        return Some(rest[..open.len() + end + close.len()].to_string());
    }
    let cut = [TOOLS_TAG, RESPONSE_TAG]
        .iter()
        .filter_map(|t| tail.find(&format!("<{t}>")))
        .min()
        .unwrap_or(tail.len());
    Some(format!("{open}{}{close}", tail[..cut].trim_end()))
}

/// 删除所有 `<tag>...</tag>` 块
fn remove_blocks(text: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = text.to_string();
    while let Some(start) = out.find(&open) {
        let end = out[start..]
            .find(&close)
            .map(|e| start + e + close.len())
            .unwrap_or(out.len());
        out.replace_range(start..end, "");
    }
    out
}

fn accepted(
    validator: &ProtocolBlockValidator,
    candidate: &str,
    expected: ExpectedOutput,
) -> Option<ProtocolResponse> {
    match validator.validate(candidate, expected) {
        Validation::Valid(resp) => Some(resp),
        _ => None,
    }
}

/// 运行修复流水线；全部失败时返回最初的违规原因
pub fn repair(
    raw: &str,
    expected: ExpectedOutput,
    validator: &ProtocolBlockValidator,
) -> Result<ProtocolResponse, Violation> {
    let original = match validator.validate(raw, expected) {
        Validation::Valid(resp) => return Ok(resp),
        Validation::ToolsOnly(_) => Violation::ToolsOnly,
        Validation::Invalid(v) => v,
    };

    let cleaned = strip_reserved(&strip_fences(raw));
    if let Some(resp) = accepted(validator, cleaned.trim(), expected) {
        return Ok(resp);
    }

    let tags: &[&str] = match expected {
        ExpectedOutput::Response => &[RESPONSE_TAG],
        ExpectedOutput::Tools => &[TOOLS_TAG],
        ExpectedOutput::Either => &[RESPONSE_TAG, TOOLS_TAG],
    };
    for tag in tags {
        if let Some(block) = extract_block(&cleaned, tag) {
            if let Some(resp) = accepted(validator, &block, expected) {
                return Ok(resp);
            }
        }
    }

    if expected != ExpectedOutput::Tools {
        if let Some(target) = validator.default_target.clone() {
            let bare = remove_blocks(&cleaned, TOOLS_TAG);
            let bare = any_tag_re().replace_all(&bare, " ");
            let bare = bare.split_whitespace().collect::<Vec<_>>().join(" ");
            if !bare.is_empty() {
                let wrapped = ResponseBlock::text_only(target, bare).to_xml();
                if let Some(resp) = accepted(validator, &wrapped, expected) {
                    return Ok(resp);
                }
            }
        }
    }

    tracing::debug!(reason = %original, "Deterministic repair failed");
    Err(original)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RoutingTarget;

    #[test]
    fn test_repairs_fenced_block_with_chatter() {
        let raw = "Here you go:\n```xml\n<sentra-response><user_id>7</user_id><text1>hi</text1></sentra-response>\n```\nHope this helps";
        let resp = repair(raw, ExpectedOutput::Response, &ProtocolBlockValidator::default()).unwrap();
        assert_eq!(resp.as_response().unwrap().text(), "hi");
    }

    #[test]
    fn test_drops_reserved_tags() {
        let raw = "<sentra-response><user_id>7</user_id><text1>ok</text1><sentra-memory>secret</sentra-memory></sentra-response>";
        let resp = repair(raw, ExpectedOutput::Response, &ProtocolBlockValidator::default()).unwrap();
        assert_eq!(resp.as_response().unwrap().text(), "ok");
    }

    #[test]
    fn test_closes_unclosed_block() {
        let raw = "<sentra-response><group_id>3</group_id><text1>done</text1>";
        let resp = repair(raw, ExpectedOutput::Response, &ProtocolBlockValidator::default()).unwrap();
        assert_eq!(
            resp.as_response().unwrap().target,
            RoutingTarget::Group("3".into())
        );
    }

    #[test]
    fn test_wraps_bare_text_with_default_target() {
        let validator = ProtocolBlockValidator::new(Some(RoutingTarget::User("u".into())), None);
        let resp = repair("The weather is sunny.", ExpectedOutput::Response, &validator).unwrap();
        assert_eq!(resp.as_response().unwrap().text(), "The weather is sunny.");
    }

    #[test]
    fn test_tools_only_is_not_wrapped_as_text() {
        let validator = ProtocolBlockValidator::new(Some(RoutingTarget::User("u".into())), None);
        let raw = r#"<sentra-tools><invoke name="search"><parameter name="q">x</parameter></invoke></sentra-tools>"#;
        assert_eq!(
            repair(raw, ExpectedOutput::Response, &validator),
            Err(Violation::ToolsOnly)
        );
    }

    #[test]
    fn test_failure_keeps_original_reason() {
        let err = repair("no block here", ExpectedOutput::Response, &ProtocolBlockValidator::default())
            .unwrap_err();
        assert_eq!(err, Violation::NoBlock);
    }
}
