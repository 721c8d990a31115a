//! Audit checkpoints.
//!
//! Every state transition appends a [`CheckpointEvent`] to the affected step's
//! record and queues an [`AuditRecord`] for the configured [`AuditSink`]s.
//! Appending is part of the in-memory mutation and cannot fail. Queued records
//! reach the sinks only through [`CheckpointEmitter::flush`], which callers
//! invoke once the document carrying those checkpoints has been saved; a failed
//! save is followed by [`CheckpointEmitter::discard`]. Delivery is best-effort
//! and only logs when a sink errors.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use pubflow_shared::{
    CheckpointEvent, Document, EntityRecord, PipelineError, Result, RunConfig, StepHistoryEntry,
    WorkflowStep,
};

/// Checkpoint operation names.
pub mod ops {
    pub const REGISTERED: &str = "registered";
    pub const MIGRATED: &str = "migrated";
    pub const STEP_STARTED: &str = "step-started";
    pub const STEP_COMPLETED: &str = "step-completed";
    pub const STEP_FAILED: &str = "step-failed";
    pub const STEP_SKIPPED: &str = "step-skipped";
    pub const STEP_RESET: &str = "step-reset";
    pub const RETRY_REQUESTED: &str = "retry-requested";
    pub const ATTEMPTS_EXHAUSTED: &str = "attempts-exhausted";
    pub const STUCK_DETECTED: &str = "stuck-detected";
    pub const FORCE_COMPLETED: &str = "force-completed";
    pub const FORCE_FAILED: &str = "force-failed";
    pub const BATCH_COMPLETED: &str = "batch-completed";
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// A checkpoint as handed to external sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// `None` for batch-level records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub step: WorkflowStep,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Append-only destination for audit records.
pub trait AuditSink: Send + Sync {
    /// Short name used in log messages.
    fn name(&self) -> &str;

    /// Deliver one record. Errors are logged by the emitter and otherwise ignored.
    fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Emits each record as a structured `tracing` event.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn record(&self, record: &AuditRecord) -> Result<()> {
        info!(
            target: "pubflow::audit",
            entity = record.entity_id.as_deref().unwrap_or("*"),
            step = %record.step,
            operation = %record.operation,
            data = %record.data,
            "checkpoint"
        );
        Ok(())
    }
}

/// Appends each record as one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn record(&self, record: &AuditRecord) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e))?
            .write_all(line.as_bytes())
            .map_err(|e| PipelineError::io(&self.path, e))
    }
}

/// Keeps records in memory. Useful for embedding callers and tests.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn record(&self, record: &AuditRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| PipelineError::Executor("audit memory sink lock poisoned".into()))?
            .push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Appends checkpoints to entity records and fans them out to sinks.
///
/// Clones share the queue of undelivered records.
#[derive(Clone, Default)]
pub struct CheckpointEmitter {
    sinks: Vec<Arc<dyn AuditSink>>,
    queued: Arc<Mutex<Vec<AuditRecord>>>,
}

impl CheckpointEmitter {
    /// An emitter with no external sinks; checkpoints are only stored in the document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build the sinks enabled in `config`.
    pub fn from_config(config: &RunConfig) -> Self {
        let mut emitter = Self::new();
        if config.audit_tracing {
            emitter = emitter.with_sink(Arc::new(TracingSink));
        }
        if let Some(path) = &config.audit_jsonl {
            emitter = emitter.with_sink(Arc::new(JsonlSink::new(path)));
        }
        emitter
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Append a checkpoint to `entity`'s record for `step` and queue it for the sinks.
    pub fn emit(
        &self,
        entity: &mut EntityRecord,
        step: WorkflowStep,
        operation: &str,
        data: serde_json::Value,
    ) {
        let event = CheckpointEvent {
            operation: operation.to_string(),
            timestamp: Utc::now(),
            data,
        };

        let record = AuditRecord {
            entity_id: Some(entity.id.clone()),
            step,
            operation: event.operation.clone(),
            timestamp: event.timestamp,
            data: event.data.clone(),
        };

        entity.step_mut(step).checkpoints.push(event);
        self.enqueue(record);
    }

    /// Append a batch summary to the global step history and queue it for the sinks.
    pub fn record_batch(&self, doc: &mut Document, entry: StepHistoryEntry) {
        let record = AuditRecord {
            entity_id: None,
            step: entry.step,
            operation: ops::BATCH_COMPLETED.to_string(),
            timestamp: entry.timestamp,
            data: serde_json::json!({
                "total": entry.processed,
                "succeeded": entry.succeeded,
                "failed": entry.failed,
                "durationMs": entry.duration_ms,
                "runId": entry.run_id,
            }),
        };

        doc.global.step_history.push(entry);
        self.enqueue(record);
    }

    /// Deliver every queued record. Call after the document was saved.
    pub fn flush(&self) {
        let records = std::mem::take(&mut *self.lock_queue());
        for record in &records {
            self.forward(record);
        }
    }

    /// Drop every queued record. Call when the save that would persist them failed.
    pub fn discard(&self) {
        let dropped = std::mem::take(&mut *self.lock_queue()).len();
        if dropped > 0 {
            warn!(dropped, "state not saved, audit records withheld");
        }
    }

    /// Number of records waiting for [`flush`](Self::flush).
    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    fn enqueue(&self, record: AuditRecord) {
        if !self.sinks.is_empty() {
            self.lock_queue().push(record);
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, Vec<AuditRecord>> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forward(&self, record: &AuditRecord) {
        for sink in &self.sinks {
            if let Err(e) = sink.record(record) {
                warn!(
                    sink = sink.name(),
                    operation = %record.operation,
                    error = %e,
                    "audit sink delivery failed, continuing"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn record(&self, _record: &AuditRecord) -> Result<()> {
            Err(PipelineError::Executor("audit endpoint unreachable".into()))
        }
    }

    #[test]
    fn emit_appends_and_forwards() {
        let memory = Arc::new(MemorySink::new());
        let emitter = CheckpointEmitter::new().with_sink(memory.clone());
        let mut entity = EntityRecord::new("p1", serde_json::Value::Null);

        emitter.emit(
            &mut entity,
            WorkflowStep::Tested,
            ops::STEP_STARTED,
            serde_json::json!({ "attempt": 1 }),
        );

        let checkpoints = &entity.step(WorkflowStep::Tested).checkpoints;
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].operation, "step-started");
        assert!(memory.records().is_empty());
        assert_eq!(emitter.queued(), 1);

        emitter.flush();
        assert_eq!(emitter.queued(), 0);
        let records = memory.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_id.as_deref(), Some("p1"));
        assert_eq!(records[0].timestamp, checkpoints[0].timestamp);
    }

    #[test]
    fn failing_sink_never_blocks_the_checkpoint() {
        let memory = Arc::new(MemorySink::new());
        let emitter = CheckpointEmitter::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(memory.clone());
        let mut entity = EntityRecord::new("p1", serde_json::Value::Null);

        emitter.emit(&mut entity, WorkflowStep::Ingested, ops::REGISTERED, serde_json::Value::Null);
        emitter.flush();

        assert_eq!(entity.step(WorkflowStep::Ingested).checkpoints.len(), 1);
        assert_eq!(memory.records().len(), 1);
    }

    #[test]
    fn discarded_records_never_reach_sinks() {
        let memory = Arc::new(MemorySink::new());
        let emitter = CheckpointEmitter::new().with_sink(memory.clone());
        let shared = emitter.clone();
        let mut entity = EntityRecord::new("p1", serde_json::Value::Null);

        shared.emit(&mut entity, WorkflowStep::Ingested, ops::STEP_STARTED, serde_json::Value::Null);
        assert_eq!(emitter.queued(), 1);
        emitter.discard();
        emitter.flush();

        assert!(memory.records().is_empty());
        assert_eq!(entity.step(WorkflowStep::Ingested).checkpoints.len(), 1);
    }

    #[test]
    fn batch_record_goes_to_step_history() {
        let memory = Arc::new(MemorySink::new());
        let emitter = CheckpointEmitter::new().with_sink(memory.clone());
        let mut doc = Document::new();

        emitter.record_batch(
            &mut doc,
            StepHistoryEntry {
                step: WorkflowStep::Validated,
                timestamp: Utc::now(),
                processed: 2,
                succeeded: 1,
                failed: 1,
                duration_ms: 40,
                run_id: None,
            },
        );
        emitter.flush();

        assert_eq!(doc.global.step_history.len(), 1);
        let records = memory.records();
        assert!(records[0].entity_id.is_none());
        assert_eq!(records[0].data["total"], 2);
        assert_eq!(records[0].data["failed"], 1);
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = std::env::temp_dir().join(format!("pubflow-audit-test-{}", Uuid::now_v7()));
        let sink = JsonlSink::new(dir.join("audit.jsonl"));
        let emitter = CheckpointEmitter::new().with_sink(Arc::new(sink));
        let mut entity = EntityRecord::new("guides/intro", serde_json::Value::Null);

        emitter.emit(&mut entity, WorkflowStep::Ingested, ops::STEP_STARTED, serde_json::Value::Null);
        emitter.emit(&mut entity, WorkflowStep::Ingested, ops::STEP_COMPLETED, serde_json::Value::Null);
        emitter.flush();

        let content = std::fs::read_to_string(dir.join("audit.jsonl")).expect("read audit log");
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).expect("valid json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["entityId"], "guides/intro");
        assert_eq!(lines[1]["operation"], "step-completed");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn from_config_respects_audit_settings() {
        let mut app = pubflow_shared::AppConfig::default();
        app.audit.tracing = false;
        let run = RunConfig::try_from(&app).expect("run config");
        assert_eq!(CheckpointEmitter::from_config(&run).sink_count(), 0);

        app.audit.tracing = true;
        app.audit.jsonl_path = Some("/tmp/pubflow-audit.jsonl".into());
        let run = RunConfig::try_from(&app).expect("run config");
        assert_eq!(CheckpointEmitter::from_config(&run).sink_count(), 2);
    }
}
