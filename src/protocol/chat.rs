//! ProtocolChat：带重试与修复阶梯的模型调用
//!
//! 阶梯：传输层瞬时错误固定退避重试 → 校验 → 首次违规时一次格式修复 → 追加违规提醒后重问（总尝试次数受限）
//! → 确定性修复 → 类型化失败。格式类失败只体现在 ChatOutcome 中；Err 仅表示传输失败或取消。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, RetryPolicy};
use crate::llm::LlmClient;
use crate::memory::{Message, TokenBudget};
use crate::protocol::block::{ExpectedOutput, ProtocolResponse, RoutingTarget, ToolsBlock};
use crate::protocol::repair;
use crate::protocol::validator::{violation_reminder, ProtocolBlockValidator, Validation, Violation};

/// ProtocolChat 运行配置
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// 模型调用总次数上限（含首次）
    pub max_retries: u32,
    /// 传输层瞬时错误的重试次数（不含首次）
    pub transport_retries: u32,
    pub transport_backoff: Duration,
    pub format_fix: bool,
    /// 单次回复 token 上限；0 表示不限
    pub max_response_tokens: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            transport_retries: 2,
            transport_backoff: Duration::from_millis(500),
            format_fix: true,
            max_response_tokens: 0,
        }
    }
}

/// 期望回复却得到工具块时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolsOnlyPolicy {
    /// 原样返回（tools_only），由调用方决定是否重启
    Return,
    /// 视为违规，进入重试/修复阶梯
    #[default]
    Repair,
}

/// 单次调用选项
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub expected: ExpectedOutput,
    pub default_target: Option<RoutingTarget>,
    pub tools_only: ToolsOnlyPolicy,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn response(default_target: Option<RoutingTarget>) -> Self {
        Self {
            expected: ExpectedOutput::Response,
            default_target,
            tools_only: ToolsOnlyPolicy::Repair,
            cancel: None,
        }
    }

    pub fn with_tools_only(mut self, policy: ToolsOnlyPolicy) -> Self {
        self.tools_only = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// 调用结果
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub response: Option<ProtocolResponse>,
    /// 最后一次模型原始输出
    pub raw: String,
    /// 重问次数（首次调用不计）
    pub retries: u32,
    pub success: bool,
    pub reason: Option<String>,
    pub tools_only: Option<ToolsBlock>,
    /// 合法但零 token 且无资源：模型选择沉默
    pub no_reply: bool,
    pub repaired: bool,
}

impl ChatOutcome {
    fn failure(raw: String, retries: u32, violation: &Violation) -> Self {
        Self {
            raw,
            retries,
            reason: Some(violation.reason()),
            ..Default::default()
        }
    }

    fn accepted(raw: String, retries: u32, response: ProtocolResponse) -> Self {
        let no_reply = response.as_response().is_some_and(|r| r.is_silent());
        Self {
            response: Some(response),
            raw,
            retries,
            success: true,
            no_reply,
            ..Default::default()
        }
    }

    /// 成功且有可发送内容的回复块
    pub fn reply(&self) -> Option<&crate::protocol::ResponseBlock> {
        if !self.success || self.no_reply {
            return None;
        }
        self.response.as_ref().and_then(ProtocolResponse::as_response)
    }
}

/// 格式修复：把一次违规输出改写为合法块
#[async_trait]
pub trait FormatFixer: Send + Sync {
    async fn fix(&self, raw: &str, violation: &Violation, expected: ExpectedOutput) -> Option<String>;
}

/// 用模型本身做格式修复
pub struct LlmFormatFixer {
    llm: Arc<dyn LlmClient>,
}

impl LlmFormatFixer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl FormatFixer for LlmFormatFixer {
    async fn fix(&self, raw: &str, violation: &Violation, expected: ExpectedOutput) -> Option<String> {
        let messages = vec![
            Message::system(format!(
                "You repair output formatting. Rewrite the user's text as exactly one <{}> block, keeping its meaning. Output the block only.",
                expected.describe()
            )),
            Message::user(format!("violation: {}\n\n{raw}", violation.reason())),
        ];
        match self.llm.complete(&messages).await {
            Ok(fixed) => Some(fixed),
            Err(e) => {
                tracing::debug!(error = %e, "Format fix call failed");
                None
            }
        }
    }
}

enum Step {
    Done(ChatOutcome),
    Violated(Violation),
}

/// 协议约束的模型调用封装
pub struct ProtocolChat {
    llm: Arc<dyn LlmClient>,
    config: ProtocolConfig,
    fixer: Option<Arc<dyn FormatFixer>>,
}

impl ProtocolChat {
    pub fn new(llm: Arc<dyn LlmClient>, config: ProtocolConfig) -> Self {
        let fixer: Option<Arc<dyn FormatFixer>> = if config.format_fix {
            Some(Arc::new(LlmFormatFixer::new(llm.clone())))
        } else {
            None
        };
        Self { llm, config, fixer }
    }

    pub fn with_fixer(mut self, fixer: Option<Arc<dyn FormatFixer>>) -> Self {
        self.fixer = fixer;
        self
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    fn validator(&self, options: &CallOptions) -> ProtocolBlockValidator {
        let budget = (self.config.max_response_tokens > 0)
            .then(|| TokenBudget::new(self.config.max_response_tokens));
        ProtocolBlockValidator::new(options.default_target.clone(), budget)
    }

    fn step(
        &self,
        validator: &ProtocolBlockValidator,
        raw: &str,
        retries: u32,
        options: &CallOptions,
    ) -> Step {
        match validator.validate(raw, options.expected) {
            Validation::Valid(resp) => Step::Done(ChatOutcome::accepted(raw.to_string(), retries, resp)),
            Validation::ToolsOnly(block) if options.tools_only == ToolsOnlyPolicy::Return => {
                Step::Done(ChatOutcome {
                    raw: raw.to_string(),
                    retries,
                    reason: Some(Violation::ToolsOnly.reason()),
                    tools_only: Some(block),
                    ..Default::default()
                })
            }
            Validation::ToolsOnly(_) => Step::Violated(Violation::ToolsOnly),
            Validation::Invalid(v) => Step::Violated(v),
        }
    }

    async fn complete(
        &self,
        conversation: &[Message],
        cancel: Option<&CancellationToken>,
    ) -> Result<String, AgentError> {
        let policy = RetryPolicy::new(self.config.transport_retries + 1, self.config.transport_backoff);
        policy
            .run(cancel, |_| self.llm.complete(conversation))
            .await
    }

    /// 调用模型并保证输出为合法协议块或类型化失败
    pub async fn call(
        &self,
        conversation: &[Message],
        options: &CallOptions,
    ) -> Result<ChatOutcome, AgentError> {
        let validator = self.validator(options);
        let cancel = options.cancel.as_ref();
        let max_attempts = self.config.max_retries.max(1);
        let mut convo = conversation.to_vec();
        let mut fix_used = false;
        let mut last: Option<(String, Violation)> = None;

        for attempt in 0..max_attempts {
            let raw = self.complete(&convo, cancel).await?;
            let mut violation = match self.step(&validator, &raw, attempt, options) {
                Step::Done(outcome) => return Ok(outcome),
                Step::Violated(v) => v,
            };

            if !fix_used {
                if let Some(fixer) = &self.fixer {
                    fix_used = true;
                    if let Some(fixed) = fixer.fix(&raw, &violation, options.expected).await {
                        match self.step(&validator, &fixed, attempt, options) {
                            Step::Done(mut outcome) => {
                                outcome.repaired = true;
                                return Ok(outcome);
                            }
                            Step::Violated(v) => violation = v,
                        }
                    }
                }
            }

            tracing::warn!(
                attempt = attempt + 1,
                max_attempts,
                reason = %violation,
                "Protocol violation in model output"
            );
            if attempt + 1 < max_attempts {
                convo.push(Message::assistant(raw.clone()));
                convo.push(Message::user(violation_reminder(&violation, options.expected)));
            }
            last = Some((raw, violation));
        }

        let retries = max_attempts - 1;
        let Some((raw, violation)) = last else {
            return Ok(ChatOutcome::failure(String::new(), retries, &Violation::Empty));
        };
        match repair::repair(&raw, options.expected, &validator) {
            Ok(resp) => {
                tracing::info!(reason = %violation, "Model output accepted after deterministic repair");
                let mut outcome = ChatOutcome::accepted(raw, retries, resp);
                outcome.repaired = true;
                Ok(outcome)
            }
            Err(_) => Ok(ChatOutcome::failure(raw, retries, &violation)),
        }
    }
}
