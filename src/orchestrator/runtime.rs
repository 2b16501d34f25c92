//! 编排器运行时：组件装配、入口与后台任务
//!
//! handle_message：回复闸门 → 回合监管（会话忙则排队为补充消息）→ 运行回合，并由同一任务依次处理排队消息。
//! 回合后的钩子与完成度审计都在 TaskTracker 中运行，shutdown 时统一等待。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::agent::AgentStream;
use crate::collab::{
    AlwaysReply, ConversationPairStore, InboundMessage, MessageSender, PostTurnHook, ReplyGate,
    RetrievalContext, RetrievalProvider, TurnReport,
};
use crate::completion::{AnalysisInput, CompletionAnalyzer, ToolCallRecord};
use crate::core::{Admission, SharedCache, TurnSupervisor};
use crate::jobs::DelayedJobQueue;
use crate::memory::{trim_history, Message};
use crate::orchestrator::narration::Narrator;
use crate::orchestrator::pre_reply::{PreReplyConfig, PreReplyGate};
use crate::orchestrator::snapshot::{snapshot_cache, SnapshotCache};
use crate::orchestrator::swallow::SwallowState;
use crate::orchestrator::turn::Turn;
use crate::protocol::ProtocolChat;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 发送前等待补充消息的上限；0 表示只检查不等待
    pub supplement_wait: Duration,
    /// 进度事件触发增量回复
    pub incremental_replies: bool,
    /// 每回合因 tools-only 判定而重启的上限
    pub max_restarts: u32,
    pub retrieval_timeout: Duration,
    pub retrieval_ttl: Duration,
    pub snapshot_ttl: Duration,
    /// 进入上下文的历史消息条数
    pub history_limit: usize,
    /// 工具调用次数耗尽且最终回复失败时发送的提醒
    pub tool_limit_reminder: String,
    pub pre_reply: PreReplyConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            supplement_wait: Duration::from_millis(800),
            incremental_replies: false,
            max_restarts: 1,
            retrieval_timeout: Duration::from_secs(3),
            retrieval_ttl: Duration::from_secs(300),
            snapshot_ttl: Duration::from_secs(3_600),
            history_limit: 40,
            tool_limit_reminder:
                "I reached the tool-call limit for this request before finishing. Tell me if you want me to continue."
                    .to_string(),
            pre_reply: PreReplyConfig::default(),
        }
    }
}

/// 回合结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEnd {
    Replied,
    /// 模型选择沉默
    Silent,
    /// 转交延迟任务
    Scheduled,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub run_id: Option<String>,
    pub end: TurnEnd,
    /// 真实发送次数（不含预回复）
    pub sent: usize,
    pub swallowed: usize,
    pub restarts: u32,
    pub final_text: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

#[derive(Debug)]
pub enum HandleResult {
    /// 回复闸门拒绝
    Ignored,
    /// 会话已有回合在跑，消息排队
    Queued { position: usize },
    /// 本次及随后排队消息的回合结果
    Processed(Vec<TurnOutcome>),
}

pub struct Orchestrator {
    pub(crate) agent: Arc<dyn AgentStream>,
    pub(crate) chat: Arc<ProtocolChat>,
    pub(crate) narrator: Narrator,
    pub(crate) pairs: Arc<dyn ConversationPairStore>,
    pub(crate) sender: Arc<dyn MessageSender>,
    gate: Arc<dyn ReplyGate>,
    retrieval: Option<Arc<dyn RetrievalProvider>>,
    hooks: Vec<Arc<dyn PostTurnHook>>,
    pub(crate) jobs: Arc<DelayedJobQueue>,
    analyzer: Option<Arc<CompletionAnalyzer>>,
    pub(crate) supervisor: Arc<TurnSupervisor>,
    pub(crate) snapshots: Arc<SnapshotCache>,
    retrieval_cache: SharedCache<String, RetrievalContext>,
    history: SharedCache<String, Vec<Message>>,
    pub(crate) swallow: Arc<SwallowState>,
    pub(crate) pre_reply: Arc<PreReplyGate>,
    pub(crate) tracker: TaskTracker,
    pub(crate) config: OrchestratorConfig,
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    agent: Arc<dyn AgentStream>,
    chat: Arc<ProtocolChat>,
    pairs: Arc<dyn ConversationPairStore>,
    sender: Arc<dyn MessageSender>,
    gate: Arc<dyn ReplyGate>,
    retrieval: Option<Arc<dyn RetrievalProvider>>,
    hooks: Vec<Arc<dyn PostTurnHook>>,
    jobs: Option<Arc<DelayedJobQueue>>,
    analyzer: Option<Arc<CompletionAnalyzer>>,
    snapshots: Option<Arc<SnapshotCache>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn new(
        agent: Arc<dyn AgentStream>,
        chat: Arc<ProtocolChat>,
        pairs: Arc<dyn ConversationPairStore>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            agent,
            chat,
            pairs,
            sender,
            gate: Arc::new(AlwaysReply),
            retrieval: None,
            hooks: Vec::new(),
            jobs: None,
            analyzer: None,
            snapshots: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reply_gate(mut self, gate: Arc<dyn ReplyGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalProvider>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostTurnHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// 与 JobWorker 共享的队列
    pub fn with_job_queue(mut self, jobs: Arc<DelayedJobQueue>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<CompletionAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// 与 JobWorker 共享的快照缓存
    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotCache>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        Orchestrator {
            narrator: Narrator::new(self.chat.clone()),
            agent: self.agent,
            chat: self.chat,
            pairs: self.pairs,
            sender: self.sender,
            gate: self.gate,
            retrieval: self.retrieval,
            hooks: self.hooks,
            jobs: self
                .jobs
                .unwrap_or_else(|| Arc::new(DelayedJobQueue::in_memory())),
            analyzer: self.analyzer,
            supervisor: Arc::new(TurnSupervisor::new()),
            snapshots: self
                .snapshots
                .unwrap_or_else(|| Arc::new(snapshot_cache(1_024, config.snapshot_ttl))),
            retrieval_cache: SharedCache::new(256, Some(config.retrieval_ttl)),
            history: SharedCache::new(4_096, None),
            swallow: Arc::new(SwallowState::default()),
            pre_reply: Arc::new(PreReplyGate::new(config.pre_reply.clone())),
            tracker: TaskTracker::new(),
            config,
        }
    }
}

impl Orchestrator {
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<TurnSupervisor> {
        &self.supervisor
    }

    pub fn job_queue(&self) -> &Arc<DelayedJobQueue> {
        &self.jobs
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCache> {
        &self.snapshots
    }

    pub fn narrator(&self) -> &Narrator {
        &self.narrator
    }

    /// 入站消息入口
    pub async fn handle_message(&self, message: InboundMessage) -> HandleResult {
        if !self.gate.should_reply(&message).await {
            tracing::debug!(message_id = %message.message_id, "Reply gate declined message");
            return HandleResult::Ignored;
        }

        let key = message.conversation_key();
        let (mut current, mut ticket) = match self.supervisor.submit(message.clone()) {
            Admission::Queued { position } => {
                tracing::info!(conversation = %key, position, "Turn active, message queued as supplement");
                return HandleResult::Queued { position };
            }
            Admission::Start(ticket) => (message, ticket),
        };

        let mut outcomes = Vec::new();
        loop {
            let history = self.history.get(&key).unwrap_or_default();
            let outcome = self
                .run_turn_with_cancel(&current, history, ticket.cancel.clone())
                .await;
            self.remember(&key, &current, &outcome);
            outcomes.push(outcome);

            match self.supervisor.complete(&key) {
                Some((next, next_ticket)) => {
                    tracing::debug!(conversation = %key, "Draining queued message as follow-up turn");
                    current = next;
                    ticket = next_ticket;
                }
                None => break,
            }
        }
        HandleResult::Processed(outcomes)
    }

    /// 运行单个回合
    pub async fn run_turn(&self, message: &InboundMessage, history: Vec<Message>) -> TurnOutcome {
        self.run_turn_with_cancel(message, history, CancellationToken::new())
            .await
    }

    pub async fn run_turn_with_cancel(
        &self,
        message: &InboundMessage,
        history: Vec<Message>,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let context = self.build_context(message, &history).await;
        Turn::new(self, message, context, cancel).run().await
    }

    /// 取消会话当前回合
    pub fn cancel_conversation(&self, conversation_key: &str) -> bool {
        self.supervisor.cancel(conversation_key)
    }

    async fn build_context(&self, message: &InboundMessage, history: &[Message]) -> Vec<Message> {
        let mut context = trim_history(history, self.config.history_limit);
        if let Some(rag) = self.retrieve(message).await {
            context.push(Message::system(format!(
                "<sentra-rag-context>\n{}\n</sentra-rag-context>",
                rag.text
            )));
        }
        context.push(Message::user(message.text.clone()));
        context
    }

    async fn retrieve(&self, message: &InboundMessage) -> Option<RetrievalContext> {
        let provider = self.retrieval.as_ref()?;
        let query = message.text.trim().to_string();
        if query.is_empty() {
            return None;
        }
        if let Some(hit) = self.retrieval_cache.get(&query) {
            return (!hit.text.is_empty()).then_some(hit);
        }

        let key = message.conversation_key();
        match tokio::time::timeout(self.config.retrieval_timeout, provider.retrieve(&query, &key)).await {
            Ok(Ok(ctx)) => {
                tracing::debug!(
                    conversation = %key,
                    hits = ctx.stats.hits,
                    elapsed_ms = ctx.stats.elapsed_ms,
                    "Retrieval context loaded"
                );
                self.retrieval_cache.insert(query, ctx.clone());
                (!ctx.text.is_empty()).then_some(ctx)
            }
            Ok(Err(e)) => {
                tracing::warn!(conversation = %key, error = %e, "Retrieval failed, continuing without context");
                None
            }
            Err(_) => {
                tracing::warn!(conversation = %key, "Retrieval timed out, continuing without context");
                None
            }
        }
    }

    fn remember(&self, key: &str, message: &InboundMessage, outcome: &TurnOutcome) {
        let mut history = self.history.get(&key.to_string()).unwrap_or_default();
        history.push(Message::user(message.text.clone()));
        if let Some(text) = &outcome.final_text {
            history.push(Message::assistant(text.clone()));
        }
        self.history
            .insert(key.to_string(), trim_history(&history, self.config.history_limit));
    }

    /// 会话在编排器内记录的历史
    pub fn history(&self, conversation_key: &str) -> Vec<Message> {
        self.history
            .get(&conversation_key.to_string())
            .unwrap_or_default()
    }

    /// 回合后钩子与完成度审计（后台、受 tracker 管理）
    pub(crate) fn spawn_post_turn(&self, report: TurnReport, analysis: Option<AnalysisInput>) {
        for hook in &self.hooks {
            let hook = hook.clone();
            let report = report.clone();
            self.tracker.spawn(async move {
                hook.after_turn(&report).await;
            });
        }
        if let (Some(analyzer), Some(input)) = (self.analyzer.clone(), analysis) {
            if analyzer.config().enabled {
                self.tracker.spawn(async move {
                    analyzer.analyze(&input).await;
                });
            }
        }
    }

    /// 等待当前所有后台任务结束（之后仍可继续使用）
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// 取消所有回合并等待后台任务
    pub async fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");
        self.supervisor.cancel_all();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
