//! 入站消息与出站回复

use serde::{Deserialize, Serialize};

use crate::protocol::{ResponseBlock, RoutingTarget};

/// 一条入站聊天消息（平台格式化已由外部完成）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub text: String,
    /// 毫秒时间戳
    pub timestamp_ms: i64,
}

impl InboundMessage {
    pub fn private(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            sender_name: String::new(),
            group_id: None,
            text: text.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn group(
        group_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Self::private(sender_id, text)
        }
    }

    /// 会话键：群聊为 `G:<group_id>`，私聊为 `U:<sender_id>`
    pub fn conversation_key(&self) -> String {
        match &self.group_id {
            Some(g) => format!("G:{g}"),
            None => format!("U:{}", self.sender_id),
        }
    }

    /// 回复的默认路由目标
    pub fn default_target(&self) -> RoutingTarget {
        match &self.group_id {
            Some(g) => RoutingTarget::Group(g.clone()),
            None => RoutingTarget::User(self.sender_id.clone()),
        }
    }
}

/// 交给 MessageSender 的一次回复
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundReply {
    pub conversation_key: String,
    pub block: ResponseBlock,
    /// 引用回复的原消息 id；同一回合至多一次回复携带
    pub reply_to: Option<String>,
}
