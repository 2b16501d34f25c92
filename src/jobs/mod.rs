//! 延迟任务：模型、存储、队列与 worker

pub mod job;
pub mod queue;
pub mod store;
pub mod worker;

pub use job::{DelayedJob, JobId, JobKind};
pub use queue::DelayedJobQueue;
#[cfg(feature = "async-sqlite")]
pub use store::SqliteJobStore;
pub use store::{JobStore, MemoryJobStore};
pub use worker::{JobOutcome, JobWorker, JobsConfig};
