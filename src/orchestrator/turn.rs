//! 单个回合的状态机
//!
//! 一个 Turn 消费一次（或重启后的多次）智能体运行的事件流，每种事件一个处理函数：
//! START 记录快照，JUDGE 决定直接回复或等待工具，ARGS/TOOL_RESULT 写入调用轨迹，
//! TOOL_CHOICE 转交延迟任务并播报，COMPLETED 汇总结果生成最终回复。
//!
//! 对话对（ConversationPair）在回合内至多打开一个，退出时必须已 finish 或 cancel。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    AgentEvent, AgentEventStream, AgentRequest, ExecSummary, OrderingKey, PlanStep, ResultKind,
    ScheduleDescriptor, ScheduleMode, ToolChoiceStatus, ToolResultEvent,
};
use crate::collab::{InboundMessage, OutboundReply, PairId, TurnReport};
use crate::completion::AnalysisInput;
use crate::core::AgentError;
use crate::jobs::DelayedJob;
use crate::memory::{Message, Role};
use crate::orchestrator::narration::{
    result_group_message, schedule_tool_result, tool_result_message, NarrationRequest,
};
use crate::orchestrator::runtime::{Orchestrator, TurnEnd, TurnOutcome};
use crate::orchestrator::snapshot::RunSnapshot;
use crate::orchestrator::trace::ToolTrace;
use crate::protocol::{CallOptions, ChatOutcome, ResponseBlock, RoutingTarget, ToolsOnlyPolicy};

const FINAL_INSTRUCTION: &str = "Answer the user based on the tool results above.";
const PROGRESS_INSTRUCTION: &str = "Give the user a short progress update based on the results above.";

/// 事件处理后的控制流
enum Flow {
    Continue,
    /// 以改写后的目标重启运行
    Restart(String),
    Done(TurnEnd),
}

pub(crate) struct Turn<'a> {
    orch: &'a Orchestrator,
    message: &'a InboundMessage,
    key: String,
    target: RoutingTarget,
    cancel: CancellationToken,
    context: Vec<Message>,
    objective: String,
    run_id: Option<String>,
    pair: Option<PairId>,
    trace: ToolTrace,
    /// step_index → (tool, args)，等待对应结果事件
    args_buffer: HashMap<usize, (String, Value)>,
    /// step_index → (tool, args)，本次运行内不消费，供重复的结果事件回查
    step_args: HashMap<usize, (String, Value)>,
    restarts: u32,
    pre_reply_used: bool,
    pre_reply_cancel: Option<CancellationToken>,
    pre_reply_sent: Arc<AtomicBool>,
    reply_to_used: Arc<AtomicBool>,
    sent: usize,
    swallowed: usize,
    last_text: Option<String>,
    final_text: Option<String>,
    post_turn_done: bool,
}

impl<'a> Turn<'a> {
    pub(crate) fn new(
        orch: &'a Orchestrator,
        message: &'a InboundMessage,
        context: Vec<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orch,
            message,
            key: message.conversation_key(),
            target: message.default_target(),
            cancel,
            context,
            objective: message.text.clone(),
            run_id: None,
            pair: None,
            trace: ToolTrace::new(),
            args_buffer: HashMap::new(),
            step_args: HashMap::new(),
            restarts: 0,
            pre_reply_used: false,
            pre_reply_cancel: None,
            pre_reply_sent: Arc::new(AtomicBool::new(false)),
            reply_to_used: Arc::new(AtomicBool::new(false)),
            sent: 0,
            swallowed: 0,
            last_text: None,
            final_text: None,
            post_turn_done: false,
        }
    }

    pub(crate) async fn run(mut self) -> TurnOutcome {
        let end = self.drive().await;
        self.stop_pre_reply();
        self.discard_pair("turn exit").await;
        tracing::info!(
            conversation = %self.key,
            run_id = ?self.run_id,
            end = ?end,
            sent = self.sent,
            swallowed = self.swallowed,
            restarts = self.restarts,
            tool_calls = self.trace.len(),
            "Turn finished"
        );
        TurnOutcome {
            run_id: self.run_id.clone(),
            end,
            sent: self.sent,
            swallowed: self.swallowed,
            restarts: self.restarts,
            final_text: self.final_text.clone(),
            tool_calls: self.trace.records(),
        }
    }

    async fn drive(&mut self) -> TurnEnd {
        if self.cancel.is_cancelled() {
            return self.abort().await;
        }
        let mut stream = match self.start_stream().await {
            Ok(s) => s,
            Err(e) => return self.fail(e),
        };
        let cancel = self.cancel.clone();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abort().await,
                event = stream.next() => event,
            };
            let Some(event) = event else {
                tracing::warn!(conversation = %self.key, run_id = ?self.run_id, "Agent stream ended without completion");
                return if self.sent > 0 {
                    self.finish_pair().await;
                    self.spawn_post_turn(false);
                    TurnEnd::Replied
                } else {
                    TurnEnd::Failed("stream ended without completion".to_string())
                };
            };
            tracing::debug!(conversation = %self.key, event = event.kind(), "Agent event");

            match self.on_event(event).await {
                Flow::Continue => {}
                Flow::Restart(objective) => match self.restart(objective).await {
                    Ok(s) => stream = s,
                    Err(e) => return self.fail(e),
                },
                Flow::Done(end) => return end,
            }
            if self.cancel.is_cancelled() {
                return self.abort().await;
            }
        }
    }

    async fn start_stream(&mut self) -> Result<AgentEventStream, AgentError> {
        let supplements = self
            .orch
            .supervisor
            .supplements(&self.key)
            .into_iter()
            .map(|m| m.text)
            .collect();
        let request = AgentRequest {
            conversation_key: self.key.clone(),
            sender_id: self.message.sender_id.clone(),
            group_id: self.message.group_id.clone(),
            objective: self.objective.clone(),
            context: self.context.clone(),
            supplements,
        };
        self.orch.agent.start(request).await
    }

    async fn restart(&mut self, objective: String) -> Result<AgentEventStream, AgentError> {
        if let Some(run_id) = self.run_id.take() {
            self.orch.agent.cancel(&run_id).await;
        }
        self.restarts += 1;
        self.objective = objective;
        self.args_buffer.clear();
        self.step_args.clear();
        self.trace.clear();
        tracing::info!(
            conversation = %self.key,
            restarts = self.restarts,
            objective = %self.objective,
            "Restarting run with rewritten objective"
        );
        self.start_stream().await
    }

    async fn on_event(&mut self, event: AgentEvent) -> Flow {
        match event {
            AgentEvent::Start { run_id } => {
                self.on_start(run_id);
                Flow::Continue
            }
            AgentEvent::Judge { need, tool_names } => self.on_judge(need, tool_names).await,
            AgentEvent::Plan { steps } => {
                self.on_plan(&steps);
                Flow::Continue
            }
            AgentEvent::Args {
                step_index,
                tool_name,
                args,
            } => {
                self.buffer_args(step_index, tool_name, args);
                Flow::Continue
            }
            AgentEvent::ArgsGroup { items } => {
                for item in items {
                    self.buffer_args(item.step_index, item.tool_name, item.args);
                }
                Flow::Continue
            }
            AgentEvent::ToolResult(event) => self.on_results(vec![event]).await,
            AgentEvent::ToolResultGroup { events } => self.on_results(events).await,
            AgentEvent::ToolChoice {
                status,
                tool_name,
                args,
                step_index,
                schedule,
                delay_ms,
                reason,
            } => {
                self.on_tool_choice(status, tool_name, args, step_index, schedule, delay_ms, reason)
                    .await
            }
            AgentEvent::Completed { run_id, exec } => {
                tracing::debug!(conversation = %self.key, %run_id, total = exec.total, "Run completed");
                self.on_completed(exec).await
            }
            AgentEvent::Summary { text } => {
                tracing::debug!(conversation = %self.key, chars = text.len(), "Run summary");
                if self.pair.is_none() && self.sent == 0 {
                    Flow::Done(TurnEnd::Silent)
                } else {
                    Flow::Continue
                }
            }
            AgentEvent::Unknown => Flow::Continue,
        }
    }

    fn on_start(&mut self, run_id: String) {
        self.orch.snapshots.insert(
            run_id.clone(),
            RunSnapshot::new(run_id.clone(), self.message.clone(), self.context.clone()),
        );
        if self.orch.supervisor.has_supplement(&self.key) {
            tracing::info!(conversation = %self.key, %run_id, "Supplement already queued at run start");
        }
        self.run_id = Some(run_id);
    }

    async fn on_judge(&mut self, need: bool, tool_names: Vec<String>) -> Flow {
        self.ensure_pair().await;
        if need {
            tracing::debug!(conversation = %self.key, tools = ?tool_names, "Judge requested tools");
            return Flow::Continue;
        }

        // 还能重启时把 tools-only 交回来改写目标，否则强制修复为回复
        let policy = if self.restarts < self.orch.config.max_restarts {
            ToolsOnlyPolicy::Return
        } else {
            ToolsOnlyPolicy::Repair
        };
        let options = self.call_options().with_tools_only(policy);
        let outcome = match self.orch.chat.call(&self.reply_conversation(), &options).await {
            Ok(o) => o,
            Err(e) if e.is_cancelled() => return Flow::Done(self.abort().await),
            Err(e) => return Flow::Done(self.fail(e)),
        };

        if let Some(tools) = &outcome.tools_only {
            tracing::warn!(
                conversation = %self.key,
                tools = ?tools.tool_names(),
                "Direct reply was tools-only"
            );
            self.discard_pair("tools-only direct reply").await;
            return Flow::Restart(tools.to_objective(&self.message.text));
        }
        self.finish_with(outcome, false).await
    }

    fn on_plan(&mut self, steps: &[PlanStep]) {
        let names: Vec<String> = steps.iter().map(|s| s.tool_name.clone()).collect();
        self.maybe_pre_reply(names);
    }

    fn buffer_args(&mut self, step_index: usize, tool_name: String, args: Value) {
        self.trace
            .record_invocation(&tool_name, args.clone(), OrderingKey::step(step_index));
        self.step_args
            .insert(step_index, (tool_name.clone(), args.clone()));
        self.args_buffer.insert(step_index, (tool_name, args));
    }

    /// 结果事件自带参数优先，否则取同一步骤的参数；缓冲区已被消费时回查 step_args
    fn resolve_args(&mut self, event: &ToolResultEvent, consume: bool) -> Value {
        if let Some(args) = &event.args {
            return args.clone();
        }
        let Some(i) = event.ordering.step_index else {
            return Value::Null;
        };
        let tool = event.tool_name.as_str();
        let buffered = self
            .args_buffer
            .get(&i)
            .filter(|(t, _)| t == tool)
            .map(|(_, args)| args.clone());
        if consume && buffered.is_some() {
            self.args_buffer.remove(&i);
        }
        buffered
            .or_else(|| {
                self.step_args
                    .get(&i)
                    .filter(|(t, _)| t == tool)
                    .map(|(_, args)| args.clone())
            })
            .unwrap_or(Value::Null)
    }

    async fn on_results(&mut self, events: Vec<ToolResultEvent>) -> Flow {
        let mut progress = Vec::new();
        for event in events {
            let terminal = event.kind == ResultKind::Result;
            let args = self.resolve_args(&event, terminal);
            if terminal {
                let fresh = self.trace.record_result(
                    &event.tool_name,
                    args,
                    event.ordering,
                    event.result,
                );
                if !fresh {
                    tracing::debug!(conversation = %self.key, tool = %event.tool_name, "Duplicate tool result collapsed");
                }
            } else {
                self.trace
                    .record_invocation(&event.tool_name, args.clone(), event.ordering.clone());
                progress.push((event.tool_name, args, event.result));
            }
        }

        if progress.is_empty() || !self.orch.config.incremental_replies {
            return Flow::Continue;
        }
        self.incremental_reply(progress).await
    }

    async fn incremental_reply(
        &mut self,
        progress: Vec<(String, Value, Option<crate::agent::ToolResult>)>,
    ) -> Flow {
        let mut convo = self.reply_conversation();
        for entry in self.trace.unreported() {
            if let Some(result) = &entry.result {
                convo.push(tool_result_message(&entry.tool_name, &entry.args, result));
            }
        }
        for (tool, args, result) in &progress {
            if let Some(result) = result {
                convo.push(tool_result_message(tool, args, result));
            }
        }
        convo.push(Message::user(PROGRESS_INSTRUCTION));

        let outcome = match self.orch.chat.call(&convo, &self.call_options()).await {
            Ok(o) => o,
            Err(e) if e.is_cancelled() => return Flow::Done(self.abort().await),
            Err(e) => {
                tracing::warn!(conversation = %self.key, error = %e, "Incremental reply failed");
                return Flow::Continue;
            }
        };
        if let Some(block) = outcome.reply().cloned() {
            if self.deliver_interim(block).await {
                self.trace.mark_all_reported();
            }
        }
        Flow::Continue
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_tool_choice(
        &mut self,
        status: ToolChoiceStatus,
        tool_name: String,
        args: Value,
        step_index: Option<usize>,
        schedule: Option<ScheduleDescriptor>,
        delay_ms: u64,
        reason: Option<String>,
    ) -> Flow {
        let buffered = step_index.and_then(|i| {
            self.args_buffer
                .remove(&i)
                .or_else(|| self.step_args.get(&i).cloned())
        });
        let args = if args.is_null() {
            buffered.map(|(_, a)| a).unwrap_or(Value::Null)
        } else {
            args
        };
        let ordering = step_index.map(OrderingKey::step).unwrap_or_default();
        let result = schedule_tool_result(status, schedule.as_ref(), delay_ms, reason.as_deref());
        self.trace
            .record_result(&tool_name, args.clone(), ordering, Some(result.clone()));

        let delayed_exec = status == ToolChoiceStatus::Scheduled
            && schedule
                .as_ref()
                .is_some_and(|s| s.mode == ScheduleMode::DelayedExec);

        if status == ToolChoiceStatus::Scheduled || delay_ms > 0 {
            if self.cancel.is_cancelled() {
                return Flow::Done(self.abort().await);
            }
            let mut job = DelayedJob::new(
                status.into(),
                self.run_id.clone().unwrap_or_default(),
                tool_name.clone(),
                args.clone(),
                delay_ms,
            )
            .with_identity(
                self.message.sender_id.clone(),
                self.message.sender_name.clone(),
                self.message.group_id.clone(),
            )
            .with_objective(self.objective.clone())
            .with_reason(reason.clone().unwrap_or_default());
            if let Some(schedule) = schedule.clone() {
                job = job.with_schedule(schedule);
            }
            if let Err(e) = self.orch.jobs.enqueue(job).await {
                tracing::warn!(conversation = %self.key, tool = %tool_name, error = %e, "Failed to enqueue delayed job");
            }
        }

        if delayed_exec {
            if let Some(run_id) = &self.run_id {
                tracing::info!(conversation = %self.key, %run_id, tool = %tool_name, "Delayed execution handed to job queue");
                self.orch.agent.cancel(run_id).await;
            }
        }

        if self.pre_reply_sent.load(Ordering::SeqCst) {
            tracing::info!(conversation = %self.key, tool = %tool_name, "Pre-reply already sent, skipping narration");
            self.discard_pair("narration skipped").await;
            self.spawn_post_turn(false);
            return Flow::Done(TurnEnd::Scheduled);
        }

        let request = NarrationRequest {
            target: self.target.clone(),
            history: self.reply_conversation(),
            tool_name: tool_name.clone(),
            args,
            result,
        };
        match self
            .orch
            .narrator
            .compose(&request, Some(self.cancel.clone()))
            .await
        {
            Ok(outcome) => match outcome.reply().cloned() {
                Some(block) => {
                    if self.deliver_interim(block).await {
                        self.trace.mark_all_reported();
                    }
                }
                None => {
                    tracing::warn!(conversation = %self.key, reason = ?outcome.reason, "Narration produced no reply");
                }
            },
            Err(e) if e.is_cancelled() => return Flow::Done(self.abort().await),
            Err(e) => {
                tracing::warn!(conversation = %self.key, error = %e, "Narration failed");
            }
        }

        if delayed_exec {
            if self.cancel.is_cancelled() {
                return Flow::Done(self.abort().await);
            }
            self.finish_pair().await;
            self.final_text = self.last_text.clone();
            self.spawn_post_turn(false);
            return Flow::Done(TurnEnd::Scheduled);
        }
        Flow::Continue
    }

    async fn on_completed(&mut self, exec: ExecSummary) -> Flow {
        if self.trace.all_reported() {
            tracing::debug!(conversation = %self.key, "Results already covered by earlier replies");
            self.finish_pair().await;
            self.final_text = self.last_text.clone();
            self.spawn_post_turn(false);
            return Flow::Done(TurnEnd::Replied);
        }

        let mut convo = self.reply_conversation();
        convo.push(result_group_message(self.trace.sorted()));
        convo.push(Message::user(FINAL_INSTRUCTION));

        match self.orch.chat.call(&convo, &self.call_options()).await {
            Ok(outcome) => self.finish_with(outcome, exec.limit_reached).await,
            Err(e) if e.is_cancelled() => Flow::Done(self.abort().await),
            Err(e) if exec.limit_reached => {
                tracing::warn!(conversation = %self.key, error = %e, "Final reply failed at tool limit");
                Flow::Done(self.send_limit_reminder().await)
            }
            Err(e) => Flow::Done(self.fail(e)),
        }
    }

    async fn finish_with(&mut self, outcome: ChatOutcome, limit_reached: bool) -> Flow {
        self.stop_pre_reply();
        if outcome.no_reply {
            tracing::info!(conversation = %self.key, "Model chose silence");
            self.discard_pair("no reply").await;
            self.spawn_post_turn(false);
            return Flow::Done(TurnEnd::Silent);
        }
        if let Some(block) = outcome.reply().cloned() {
            return Flow::Done(self.deliver_final(block).await);
        }

        let reason = outcome
            .reason
            .unwrap_or_else(|| "no deliverable reply".to_string());
        if limit_reached {
            tracing::warn!(conversation = %self.key, %reason, "Final reply failed at tool limit");
            return Flow::Done(self.send_limit_reminder().await);
        }
        tracing::warn!(conversation = %self.key, %reason, "Reply failed protocol validation");
        self.discard_pair("invalid reply").await;
        self.spawn_post_turn(false);
        Flow::Done(TurnEnd::Failed(reason))
    }

    async fn send_limit_reminder(&mut self) -> TurnEnd {
        let block = ResponseBlock::text_only(
            self.target.clone(),
            self.orch.config.tool_limit_reminder.clone(),
        );
        self.deliver_final(block).await
    }

    /// 最终回复：补充消息检查 → 持久化 → 发送或吞没 → 后台钩子
    async fn deliver_final(&mut self, block: ResponseBlock) -> TurnEnd {
        self.stop_pre_reply();
        if self.cancel.is_cancelled() {
            return self.abort().await;
        }
        let swallow = self.should_swallow().await;
        if self.cancel.is_cancelled() {
            return self.abort().await;
        }

        let text = block.text();
        self.ensure_pair().await;
        self.append_pair(&text).await;
        self.finish_pair().await;

        if swallow {
            self.swallowed += 1;
            tracing::info!(conversation = %self.key, "Reply swallowed, supplement arrived");
        } else {
            self.send(block).await;
        }
        self.context.push(Message::assistant(text.clone()));
        self.trace.mark_all_reported();
        self.final_text = Some(text);
        self.spawn_post_turn(false);
        TurnEnd::Replied
    }

    /// 中间回复（播报、增量回复）：写入对话对但不关闭
    async fn deliver_interim(&mut self, block: ResponseBlock) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let swallow = self.should_swallow().await;
        if self.cancel.is_cancelled() {
            return false;
        }

        let text = block.text();
        self.ensure_pair().await;
        self.append_pair(&text).await;
        let delivered = if swallow {
            self.swallowed += 1;
            tracing::info!(conversation = %self.key, "Interim reply swallowed, supplement arrived");
            true
        } else {
            self.send(block).await
        };
        self.context.push(Message::assistant(text.clone()));
        self.last_text = Some(text);
        delivered
    }

    async fn send(&mut self, block: ResponseBlock) -> bool {
        let quote = !self.reply_to_used.swap(true, Ordering::SeqCst);
        let reply = OutboundReply {
            conversation_key: self.key.clone(),
            block,
            reply_to: quote.then(|| self.message.message_id.clone()),
        };
        match self.orch.sender.send(&reply).await {
            Ok(()) => {
                self.sent += 1;
                self.orch.swallow.on_sent(&self.key);
                true
            }
            Err(e) => {
                if quote {
                    self.reply_to_used.store(false, Ordering::SeqCst);
                }
                tracing::warn!(conversation = %self.key, error = %e, "Failed to send reply");
                false
            }
        }
    }

    /// 有补充消息且本轮尚未吞没过时吞没
    async fn should_swallow(&self) -> bool {
        self.supplement_arrived().await && self.orch.swallow.try_swallow(&self.key)
    }

    async fn supplement_arrived(&self) -> bool {
        let supervisor = &self.orch.supervisor;
        if supervisor.has_supplement(&self.key) {
            return true;
        }
        let wait = self.orch.config.supplement_wait;
        if wait.is_zero() {
            return false;
        }
        let Some(notify) = supervisor.supplement_notify(&self.key) else {
            return false;
        };
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if supervisor.has_supplement(&self.key) {
            return true;
        }
        tokio::select! {
            _ = &mut notified => true,
            _ = tokio::time::sleep(wait) => supervisor.has_supplement(&self.key),
            _ = self.cancel.cancelled() => false,
        }
    }

    fn maybe_pre_reply(&mut self, tool_names: Vec<String>) {
        if self.pre_reply_used || !self.orch.pre_reply.enabled() {
            return;
        }
        self.pre_reply_used = true;
        if !self.orch.pre_reply.acquire(&self.message.sender_id, &tool_names) {
            return;
        }

        let mut convo = self.reply_conversation();
        convo.push(Message::user(format!(
            "Briefly tell the user you are working on it (tools: {}). Do not answer yet.",
            tool_names.join(", ")
        )));
        let token = self.cancel.child_token();
        self.pre_reply_cancel = Some(token.clone());
        let options = CallOptions::response(Some(self.target.clone())).with_cancel(token.clone());
        let chat = self.orch.chat.clone();
        let sender = self.orch.sender.clone();
        let swallow = self.orch.swallow.clone();
        let pre_reply_sent = self.pre_reply_sent.clone();
        let reply_to_used = self.reply_to_used.clone();
        let key = self.key.clone();
        let message_id = self.message.message_id.clone();

        self.orch.tracker.spawn(async move {
            let outcome = match chat.call(&convo, &options).await {
                Ok(o) => o,
                Err(e) => {
                    tracing::debug!(conversation = %key, error = %e, "Pre-reply skipped");
                    return;
                }
            };
            let Some(block) = outcome.reply().cloned() else {
                return;
            };
            if token.is_cancelled() {
                return;
            }
            let quote = !reply_to_used.swap(true, Ordering::SeqCst);
            let reply = OutboundReply {
                conversation_key: key.clone(),
                block,
                reply_to: quote.then_some(message_id),
            };
            match sender.send(&reply).await {
                Ok(()) => {
                    pre_reply_sent.store(true, Ordering::SeqCst);
                    swallow.on_sent(&key);
                    tracing::info!(conversation = %key, "Pre-reply sent");
                }
                Err(e) => {
                    if quote {
                        reply_to_used.store(false, Ordering::SeqCst);
                    }
                    tracing::warn!(conversation = %key, error = %e, "Pre-reply send failed");
                }
            }
        });
    }

    /// 最终回复已定：未发出的预回复不再发送，并归还冷却
    fn stop_pre_reply(&mut self) {
        let Some(token) = self.pre_reply_cancel.take() else {
            return;
        };
        token.cancel();
        if !self.pre_reply_sent.load(Ordering::SeqCst) {
            tracing::debug!(conversation = %self.key, "Pending pre-reply dropped");
            self.orch.pre_reply.release(&self.message.sender_id);
        }
    }

    /// 取消：停止运行、丢弃对话对、清理回合状态；有调用轨迹时强制审计
    async fn abort(&mut self) -> TurnEnd {
        tracing::info!(conversation = %self.key, run_id = ?self.run_id, "Turn cancelled");
        if let Some(run_id) = &self.run_id {
            self.orch.agent.cancel(run_id).await;
        }
        self.discard_pair("cancelled").await;
        self.args_buffer.clear();
        self.step_args.clear();
        self.stop_pre_reply();
        self.pre_reply_used = false;
        if !self.trace.is_empty() {
            self.spawn_post_turn(true);
        }
        TurnEnd::Cancelled
    }

    fn fail(&mut self, err: AgentError) -> TurnEnd {
        tracing::error!(conversation = %self.key, run_id = ?self.run_id, error = %err, "Turn failed");
        TurnEnd::Failed(err.to_string())
    }

    async fn ensure_pair(&mut self) {
        if self.pair.is_some() {
            return;
        }
        match self.orch.pairs.begin(&self.key, &self.message.text).await {
            Ok(id) => self.pair = Some(id),
            Err(e) => {
                tracing::warn!(conversation = %self.key, error = %e, "Failed to open conversation pair")
            }
        }
    }

    async fn append_pair(&self, text: &str) {
        if let Some(id) = &self.pair {
            if let Err(e) = self.orch.pairs.append(id, Role::Assistant, text).await {
                tracing::warn!(conversation = %self.key, error = %e, "Failed to append to conversation pair");
            }
        }
    }

    async fn finish_pair(&mut self) {
        if let Some(id) = self.pair.take() {
            if let Err(e) = self.orch.pairs.finish(&id).await {
                tracing::warn!(conversation = %self.key, error = %e, "Failed to finish conversation pair");
            }
        }
    }

    async fn discard_pair(&mut self, reason: &str) {
        if let Some(id) = self.pair.take() {
            tracing::debug!(conversation = %self.key, pair = %id, reason, "Conversation pair discarded");
            if let Err(e) = self.orch.pairs.cancel(&id).await {
                tracing::warn!(conversation = %self.key, error = %e, "Failed to cancel conversation pair");
            }
        }
    }

    fn call_options(&self) -> CallOptions {
        CallOptions::response(Some(self.target.clone())).with_cancel(self.cancel.clone())
    }

    /// 回复用的对话：上下文，加上重启后改写的目标
    fn reply_conversation(&self) -> Vec<Message> {
        let mut convo = self.context.clone();
        if self.objective != self.message.text {
            convo.push(Message::user(self.objective.clone()));
        }
        convo
    }

    /// 回合后钩子与审计只触发一次
    fn spawn_post_turn(&mut self, force: bool) {
        if self.post_turn_done {
            return;
        }
        self.post_turn_done = true;
        let final_text = self.final_text.clone().or_else(|| self.last_text.clone());
        let report = TurnReport {
            conversation_key: self.key.clone(),
            run_id: self.run_id.clone(),
            objective: self.objective.clone(),
            final_text: final_text.clone(),
            tool_calls: self.trace.len(),
        };
        let analysis = (force || !self.trace.is_empty()).then(|| AnalysisInput {
            task_id: self
                .run_id
                .clone()
                .unwrap_or_else(|| self.message.message_id.clone()),
            conversation_key: self.key.clone(),
            objective: self.objective.clone(),
            tool_calls: self.trace.records(),
            final_response: final_text,
            force,
        });
        self.orch.spawn_post_turn(report, analysis);
    }
}
