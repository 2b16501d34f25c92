//! Sentra - 本地调试入口
//!
//! 从标准输入逐行读取私聊消息，经编排器生成回复并打印；延迟任务 worker 在后台运行。
//! 未接入规划智能体时使用 DirectReplyAgent（每条消息直接回复）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use sentra::agent::DirectReplyAgent;
use sentra::collab::{InboundMessage, MemoryPairStore, MessageSender, OutboundReply};
use sentra::completion::{CompletionAnalyzer, MemoryReportStore, ReportStore};
use sentra::config::{load_config, AppConfig};
use sentra::jobs::{DelayedJobQueue, JobStore, JobWorker, MemoryJobStore};
use sentra::llm::create_llm_from_config;
use sentra::orchestrator::{snapshot_cache, OrchestratorBuilder};
use sentra::protocol::ProtocolChat;

/// 打印到标准输出的发送器
struct StdoutSender;

#[async_trait]
impl MessageSender for StdoutSender {
    async fn send(&self, reply: &OutboundReply) -> anyhow::Result<()> {
        for resource in &reply.block.resources {
            println!("[{}] {}", resource.kind, resource.source);
        }
        println!("sentra> {}", reply.block.text());
        Ok(())
    }
}

#[cfg(feature = "async-sqlite")]
async fn job_store(config: &AppConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match &config.jobs.database {
        Some(path) => {
            let store = sentra::jobs::SqliteJobStore::open(path)
                .await
                .with_context(|| format!("Failed to open job database {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryJobStore::new())),
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn job_store(_config: &AppConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    Ok(Arc::new(MemoryJobStore::new()))
}

#[cfg(feature = "async-sqlite")]
async fn report_store(config: &AppConfig) -> anyhow::Result<Arc<dyn ReportStore>> {
    match &config.completion.database {
        Some(path) => {
            let store = sentra::completion::SqliteReportStore::open(path)
                .await
                .with_context(|| format!("Failed to open report database {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryReportStore::new())),
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn report_store(_config: &AppConfig) -> anyhow::Result<Arc<dyn ReportStore>> {
    Ok(Arc::new(MemoryReportStore::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sentra::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let llm = create_llm_from_config(&config.llm);
    let chat = Arc::new(ProtocolChat::new(llm.clone(), config.protocol_config()));
    let pairs = Arc::new(MemoryPairStore::new());
    let sender: Arc<dyn MessageSender> = Arc::new(StdoutSender);

    let orch_config = config.orchestrator_config();
    let snapshots = Arc::new(snapshot_cache(1_024, orch_config.snapshot_ttl));
    let queue = Arc::new(DelayedJobQueue::new(job_store(&config).await?));
    let restored = queue.restore().await.context("Failed to restore delayed jobs")?;
    if restored > 0 {
        tracing::info!(restored, "Delayed jobs restored");
    }
    let analyzer = Arc::new(CompletionAnalyzer::new(
        llm,
        report_store(&config).await?,
        config.completion_config(),
    ));

    let orchestrator = OrchestratorBuilder::new(
        Arc::new(DirectReplyAgent),
        chat.clone(),
        pairs.clone(),
        sender.clone(),
    )
    .with_config(orch_config)
    .with_job_queue(queue.clone())
    .with_snapshots(snapshots.clone())
    .with_analyzer(analyzer)
    .build();

    let worker = JobWorker::new(
        queue,
        orchestrator.narrator().clone(),
        sender,
        pairs,
        snapshots,
        config.jobs_config(),
    );
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker_handle = tokio::spawn(async move { worker.run_until_cancelled(worker_cancel).await });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                orchestrator
                    .handle_message(InboundMessage::private("local", text))
                    .await;
            }
        }
    }

    cancel.cancel();
    orchestrator.shutdown().await;
    let _ = worker_handle.await;
    Ok(())
}
