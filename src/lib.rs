//! Sentra - 对话智能体编排核心
//!
//! 模块划分：
//! - **agent**: Agent Stream 事件类型与事件源接口
//! - **collab**: 外部协作者接口（对话对存储、消息发送、检索、回复闸门、工具执行、回合后钩子）
//! - **completion**: 完成度审计（判定、转录、报告存储）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、重试退避、TTL 缓存、会话回合监管
//! - **jobs**: 延迟任务模型、存储、队列与 worker
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息与 token 估算
//! - **orchestrator**: 回合状态机与编排运行时
//! - **protocol**: 结构化输出协议、校验、修复与 ProtocolChat

pub mod agent;
pub mod collab;
pub mod completion;
pub mod config;
pub mod core;
pub mod jobs;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod protocol;

pub use orchestrator::{HandleResult, Orchestrator, OrchestratorBuilder, TurnEnd, TurnOutcome};
pub use protocol::{ChatOutcome, ProtocolChat};
