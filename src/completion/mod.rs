//! 完成度审计：判定、转录、报告存储与分析器

pub mod analyzer;
pub mod report;
pub mod transcript;
pub mod verdict;

pub use analyzer::{AnalysisInput, CompletionAnalyzer, CompletionConfig};
#[cfg(feature = "async-sqlite")]
pub use report::SqliteReportStore;
pub use report::{CompletionReport, MemoryReportStore, ReportStore, ToolCallRecord};
pub use transcript::{build_transcript, TranscriptLimits};
pub use verdict::{parse_verdict, CompletionStatus, CompletionVerdict, Promise};
