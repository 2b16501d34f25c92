//! Agent Stream 接口：按回合启动规划/工具执行智能体，返回事件流
//!
//! 智能体内部的规划算法不在本 crate 范围内；ScriptedAgentStream 按脚本回放事件，用于测试。

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};

use crate::agent::AgentEvent;
use crate::core::AgentError;
use crate::memory::Message;

/// 事件流
pub type AgentEventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// 启动一次运行的请求
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub conversation_key: String,
    pub sender_id: String,
    pub group_id: Option<String>,
    /// 本次运行的目标（重启时为改写后的目标）
    pub objective: String,
    /// 对话上下文（含检索上下文的 system 消息）
    pub context: Vec<Message>,
    /// 回合开始后到达的补充消息
    pub supplements: Vec<String>,
}

/// 一次运行的句柄；每回合至多一个活动运行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub run_id: String,
    pub conversation_key: String,
    pub sender_id: String,
    pub cancelled: bool,
}

/// 智能体事件源
#[async_trait]
pub trait AgentStream: Send + Sync {
    async fn start(&self, request: AgentRequest) -> Result<AgentEventStream, AgentError>;

    /// 取消运行；对已结束的运行是空操作
    async fn cancel(&self, run_id: &str);
}

/// 脚本化事件源：每次 start 取出一段脚本
#[derive(Default)]
pub struct ScriptedAgentStream {
    scripts: Mutex<VecDeque<Vec<AgentEvent>>>,
    hold_open: bool,
    event_gap: Duration,
    requests: Mutex<Vec<AgentRequest>>,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedAgentStream {
    pub fn new(scripts: Vec<Vec<AgentEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    /// 脚本放完后不结束流（模拟仍在运行的智能体）
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// 每个事件前等待一段时间（让后台任务在事件之间推进）
    pub fn with_event_gap(mut self, gap: Duration) -> Self {
        self.event_gap = gap;
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn start_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn cancelled_runs(&self) -> Vec<String> {
        self.cancelled.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AgentStream for ScriptedAgentStream {
    async fn start(&self, request: AgentRequest) -> Result<AgentEventStream, AgentError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let events = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| AgentError::StreamFailed("no scripted run left".to_string()))?;
        let gap = self.event_gap;
        let replay = stream::iter(events).then(move |event| async move {
            if !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }
            event
        });
        if self.hold_open {
            Ok(replay.chain(stream::pending()).boxed())
        } else {
            Ok(replay.boxed())
        }
    }

    async fn cancel(&self, run_id: &str) {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(run_id.to_string());
    }
}

/// 不规划工具的事件源：每次运行只给出 start 与 judge(need=false)，由编排器直接回复
#[derive(Debug, Default)]
pub struct DirectReplyAgent;

#[async_trait]
impl AgentStream for DirectReplyAgent {
    async fn start(&self, request: AgentRequest) -> Result<AgentEventStream, AgentError> {
        let run_id = format!("run_{}", uuid::Uuid::new_v4().simple());
        tracing::debug!(conversation = %request.conversation_key, %run_id, "Direct reply run started");
        let events = vec![
            AgentEvent::Start { run_id },
            AgentEvent::Judge {
                need: false,
                tool_names: Vec::new(),
            },
        ];
        Ok(stream::iter(events).boxed())
    }

    async fn cancel(&self, run_id: &str) {
        tracing::debug!(%run_id, "Direct reply run cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AgentRequest {
        AgentRequest {
            conversation_key: "U:1".into(),
            sender_id: "1".into(),
            group_id: None,
            objective: "hi".into(),
            context: Vec::new(),
            supplements: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_scripted_runs_are_consumed_in_order() {
        let agent = ScriptedAgentStream::new(vec![
            vec![AgentEvent::Start { run_id: "r1".into() }],
            vec![AgentEvent::Start { run_id: "r2".into() }],
        ]);
        let first: Vec<_> = agent.start(request()).await.unwrap().collect().await;
        let second: Vec<_> = agent.start(request()).await.unwrap().collect().await;
        assert_eq!(first, vec![AgentEvent::Start { run_id: "r1".into() }]);
        assert_eq!(second, vec![AgentEvent::Start { run_id: "r2".into() }]);
        assert!(agent.start(request()).await.is_err());
        assert_eq!(agent.start_count(), 3);
    }

    #[tokio::test]
    async fn test_direct_reply_agent_judges_without_tools() {
        let events: Vec<_> = DirectReplyAgent.start(request()).await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], AgentEvent::Judge { need: false, .. }));
    }
}
