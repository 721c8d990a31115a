//! Core pipeline state machine for pubflow.
//!
//! This crate drives tracked entities through the fixed publishing steps
//! (`orchestrator`), applies retry and administrative overrides (`retry`,
//! `admin`), records audit checkpoints (`checkpoint`) and calls out to the
//! step executors that do the actual work (`executor`).

pub mod admin;
pub mod checkpoint;
pub mod executor;
pub mod migrate;
pub mod orchestrator;
pub mod retry;

pub use admin::{
    Admin, EntityTarget, OperationReport, PipelineSummary, ResetFilter, ResumeEntry, ResumeReport,
    SkippedEntity, StatusReport,
};
pub use checkpoint::{AuditRecord, AuditSink, CheckpointEmitter, JsonlSink, MemorySink, TracingSink};
pub use executor::{CommandExecutor, PassThroughExecutor, StepExecutor, StepOutcome, StepRouter};
pub use migrate::{ContentItem, discover_content};
pub use orchestrator::{
    DEFAULT_CONCURRENCY, EntityFailure, Orchestrator, ProgressReporter, RunSummary, SilentProgress,
};
pub use retry::{RetryController, RetryOutcome};
