//! Persisted state model: workflow steps, per-entity records, and the root document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Schema version written into freshly created documents.
pub const CURRENT_DOCUMENT_VERSION: &str = "1.0.0";

/// Maximum number of executions of one step before the entity is blocked.
pub const MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

/// One stage of the fixed publishing sequence. Variant order is the workflow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStep {
    Ingested,
    Tested,
    Validated,
    Published,
    Finalized,
}

impl WorkflowStep {
    /// Every step, in execution order.
    pub const ALL: [WorkflowStep; 5] = [
        Self::Ingested,
        Self::Tested,
        Self::Validated,
        Self::Published,
        Self::Finalized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingested => "ingested",
            Self::Tested => "tested",
            Self::Validated => "validated",
            Self::Published => "published",
            Self::Finalized => "finalized",
        }
    }

    /// The step that follows this one, or `None` after `finalized`.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Ingested => Some(Self::Tested),
            Self::Tested => Some(Self::Validated),
            Self::Validated => Some(Self::Published),
            Self::Published => Some(Self::Finalized),
            Self::Finalized => None,
        }
    }

    /// Steps strictly before this one.
    pub fn predecessors(self) -> impl Iterator<Item = WorkflowStep> {
        Self::ALL.into_iter().filter(move |s| *s < self)
    }

    /// This step and every step after it.
    pub fn from_here(self) -> impl Iterator<Item = WorkflowStep> {
        Self::ALL.into_iter().filter(move |s| *s >= self)
    }
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a [`WorkflowStep`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown workflow step '{value}' (expected one of: ingested, tested, validated, published, finalized)")]
pub struct ParseStepError {
    pub value: String,
}

impl std::str::FromStr for WorkflowStep {
    type Err = ParseStepError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == wanted)
            .ok_or_else(|| ParseStepError {
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a single step for a single entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Completed or skipped: the step no longer blocks later steps.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Coarse lifecycle status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityStatus {
    Draft,
    InProgress,
    Ready,
    Blocked,
    Completed,
    Failed,
}

impl EntityStatus {
    /// Whether the orchestrator may schedule work for an entity in this status.
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Draft | Self::InProgress | Self::Ready)
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::InProgress => "in-progress",
            Self::Ready => "ready",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one orchestrator run (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// An audit record describing a discrete event during step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// State of one step for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointEvent>,
}

impl StepRecord {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
            checkpoints: Vec::new(),
        }
    }

    /// Back to pending without execution results. Attempts and checkpoints are kept.
    pub fn reopen(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.duration_ms = None;
        self.error = None;
    }

    /// Like [`reopen`](Self::reopen), but also zeroes the attempt count.
    pub fn clear(&mut self) {
        self.reopen();
        self.attempts = 0;
    }
}

impl Default for StepRecord {
    fn default() -> Self {
        Self::pending()
    }
}

/// One [`StepRecord`] per [`WorkflowStep`], serialized as a map keyed by step name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTable {
    pub ingested: StepRecord,
    pub tested: StepRecord,
    pub validated: StepRecord,
    pub published: StepRecord,
    pub finalized: StepRecord,
}

impl StepTable {
    pub fn get(&self, step: WorkflowStep) -> &StepRecord {
        match step {
            WorkflowStep::Ingested => &self.ingested,
            WorkflowStep::Tested => &self.tested,
            WorkflowStep::Validated => &self.validated,
            WorkflowStep::Published => &self.published,
            WorkflowStep::Finalized => &self.finalized,
        }
    }

    pub fn get_mut(&mut self, step: WorkflowStep) -> &mut StepRecord {
        match step {
            WorkflowStep::Ingested => &mut self.ingested,
            WorkflowStep::Tested => &mut self.tested,
            WorkflowStep::Validated => &mut self.validated,
            WorkflowStep::Published => &mut self.published,
            WorkflowStep::Finalized => &mut self.finalized,
        }
    }

    /// Records in workflow order.
    pub fn iter(&self) -> impl Iterator<Item = (WorkflowStep, &StepRecord)> {
        WorkflowStep::ALL.into_iter().map(|s| (s, self.get(s)))
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// A failure recorded against an entity, kept across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityError {
    pub step: WorkflowStep,
    pub message: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Per-item pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: String,
    pub status: EntityStatus,
    pub current_step: WorkflowStep,
    pub steps: StepTable,
    /// Opaque to the pipeline; handed to executors as-is.
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub errors: Vec<EntityError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    /// A newly discovered item: `draft`, waiting at `ingested`.
    pub fn new(id: impl Into<String>, metadata: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: EntityStatus::Draft,
            current_step: WorkflowStep::Ingested,
            steps: StepTable::default(),
            metadata,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A pre-existing item recorded as already through every step.
    pub fn finalized(id: impl Into<String>, metadata: serde_json::Value) -> Self {
        let mut record = Self::new(id, metadata);
        let now = record.created_at;
        for step in WorkflowStep::ALL {
            let rec = record.steps.get_mut(step);
            rec.status = StepStatus::Completed;
            rec.completed_at = Some(now);
        }
        record.current_step = WorkflowStep::Finalized;
        record.status = EntityStatus::Completed;
        record
    }

    pub fn step(&self, step: WorkflowStep) -> &StepRecord {
        self.steps.get(step)
    }

    pub fn step_mut(&mut self, step: WorkflowStep) -> &mut StepRecord {
        self.steps.get_mut(step)
    }

    /// The step currently in `running`, if any.
    pub fn running_step(&self) -> Option<WorkflowStep> {
        self.steps
            .iter()
            .find(|(_, rec)| rec.status == StepStatus::Running)
            .map(|(step, _)| step)
    }

    /// First step that is neither completed nor skipped.
    pub fn first_open_step(&self) -> Option<WorkflowStep> {
        self.steps
            .iter()
            .find(|(_, rec)| !rec.status.is_done())
            .map(|(step, _)| step)
    }

    /// Whether every step is completed or skipped.
    pub fn all_steps_done(&self) -> bool {
        self.first_open_step().is_none()
    }

    /// Point `current_step` at the first unfinished step and derive the entity
    /// status from that step's record.
    pub fn settle_status(&mut self) {
        let Some(open) = self.first_open_step() else {
            self.current_step = WorkflowStep::Finalized;
            self.status = EntityStatus::Completed;
            return;
        };
        let rec = self.step(open);
        self.status = match rec.status {
            StepStatus::Failed if rec.attempts >= MAX_ATTEMPTS => EntityStatus::Blocked,
            StepStatus::Failed => EntityStatus::Failed,
            StepStatus::Running => EntityStatus::InProgress,
            _ if self.steps.iter().any(|(_, r)| r.status.is_done()) => EntityStatus::Ready,
            _ => EntityStatus::Draft,
        };
        self.current_step = open;
    }

    /// Whether the entity waits at `step` with that step pending and is schedulable.
    pub fn is_pending_at(&self, step: WorkflowStep) -> bool {
        self.current_step == step
            && self.step(step).status == StepStatus::Pending
            && self.status.is_schedulable()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move `step` to `running` and count the attempt.
    pub fn begin_step(&mut self, step: WorkflowStep) {
        let now = Utc::now();
        let rec = self.step_mut(step);
        rec.status = StepStatus::Running;
        rec.attempts = rec.attempts.saturating_add(1);
        rec.started_at = Some(now);
        rec.completed_at = None;
        rec.duration_ms = None;
        rec.error = None;
        self.current_step = step;
        self.status = EntityStatus::InProgress;
        self.updated_at = now;
    }

    /// Mark `step` completed and advance to the next step (or finish the entity).
    pub fn complete_step(&mut self, step: WorkflowStep, duration_ms: u64) {
        let now = Utc::now();
        let rec = self.step_mut(step);
        rec.status = StepStatus::Completed;
        rec.completed_at = Some(now);
        rec.duration_ms = Some(duration_ms);
        rec.error = None;
        self.advance_past(step);
        self.updated_at = now;
    }

    /// Mark `step` failed and park the entity there.
    pub fn fail_step(&mut self, step: WorkflowStep, message: &str, duration_ms: u64) {
        let now = Utc::now();
        let rec = self.step_mut(step);
        rec.status = StepStatus::Failed;
        rec.completed_at = Some(now);
        rec.duration_ms = Some(duration_ms);
        rec.error = Some(message.to_string());
        let attempt = rec.attempts;

        self.errors.push(EntityError {
            step,
            message: message.to_string(),
            attempt,
            timestamp: now,
        });
        self.current_step = step;
        self.status = if attempt >= MAX_ATTEMPTS {
            EntityStatus::Blocked
        } else {
            EntityStatus::Failed
        };
        self.updated_at = now;
    }

    /// Set `current_step` to the first open step after `step`, or close out the entity.
    fn advance_past(&mut self, step: WorkflowStep) {
        match step.next() {
            Some(next) => {
                self.current_step = next;
                self.status = EntityStatus::Ready;
            }
            None => {
                self.current_step = step;
                self.status = EntityStatus::Completed;
            }
        }
    }

    /// Check the per-entity state invariants.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut seen_open = false;
        let mut running = 0usize;

        for (step, rec) in self.steps.iter() {
            if rec.status.is_done() {
                if seen_open {
                    return Err(format!(
                        "{}: step {step} is {} after an unfinished earlier step",
                        self.id, rec.status
                    ));
                }
            } else {
                seen_open = true;
            }
            if rec.status == StepStatus::Running {
                running += 1;
            }
            if rec.attempts > MAX_ATTEMPTS {
                return Err(format!(
                    "{}: step {step} has {} attempts (max {MAX_ATTEMPTS})",
                    self.id, rec.attempts
                ));
            }
        }

        if running > 1 {
            return Err(format!("{}: {running} steps are running", self.id));
        }

        let expected = self.first_open_step().unwrap_or(WorkflowStep::Finalized);
        if self.current_step != expected {
            return Err(format!(
                "{}: current step is {} but first unfinished step is {expected}",
                self.id, self.current_step
            ));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GlobalState & Document
// ---------------------------------------------------------------------------

/// Summary of one step batch, appended once per step per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepHistoryEntry {
    pub step: WorkflowStep,
    pub timestamp: DateTime<Utc>,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

/// Pipeline-wide progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalState {
    pub current_step: Option<WorkflowStep>,
    #[serde(default)]
    pub step_history: Vec<StepHistoryEntry>,
}

/// The root persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub entities: BTreeMap<String, EntityRecord>,
    #[serde(default)]
    pub global: GlobalState,
}

impl Document {
    /// An empty document at the current schema version.
    pub fn new() -> Self {
        Self {
            version: CURRENT_DOCUMENT_VERSION.to_string(),
            last_updated: Utc::now(),
            entities: BTreeMap::new(),
            global: GlobalState::default(),
        }
    }

    pub fn entity(&self, id: &str) -> Result<&EntityRecord> {
        self.entities
            .get(id)
            .ok_or_else(|| PipelineError::not_found(id))
    }

    pub fn entity_mut(&mut self, id: &str) -> Result<&mut EntityRecord> {
        self.entities
            .get_mut(id)
            .ok_or_else(|| PipelineError::not_found(id))
    }

    /// Ids of entities waiting at `step` with that step pending, in id order.
    pub fn pending_at(&self, step: WorkflowStep) -> Vec<String> {
        self.entities
            .values()
            .filter(|e| e.is_pending_at(step))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Check document-level and per-entity invariants.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !is_semver(&self.version) {
            return Err(format!("version '{}' is not a semver string", self.version));
        }
        for (key, entity) in &self.entities {
            if key != &entity.id {
                return Err(format!("entity stored under '{key}' has id '{}'", entity.id));
            }
            entity.check_invariants()?;
        }
        Ok(())
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

/// `MAJOR.MINOR.PATCH` with optional `-pre` / `+build` suffixes.
fn is_semver(version: &str) -> bool {
    let core = version
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_and_parsing() {
        assert!(WorkflowStep::Ingested < WorkflowStep::Tested);
        assert!(WorkflowStep::Published < WorkflowStep::Finalized);
        assert_eq!(WorkflowStep::Validated.next(), Some(WorkflowStep::Published));
        assert_eq!(WorkflowStep::Finalized.next(), None);

        let parsed: WorkflowStep = "Validated".parse().expect("parse step");
        assert_eq!(parsed, WorkflowStep::Validated);
        let err = "draft".parse::<WorkflowStep>().unwrap_err();
        assert_eq!(err.value, "draft");

        let before: Vec<_> = WorkflowStep::Validated.predecessors().collect();
        assert_eq!(before, vec![WorkflowStep::Ingested, WorkflowStep::Tested]);
    }

    #[test]
    fn entity_serializes_with_camel_case_and_step_map() {
        let entity = EntityRecord::new("p1", serde_json::json!({ "title": "Intro" }));
        let json = serde_json::to_value(&entity).expect("serialize");

        assert_eq!(json["status"], "draft");
        assert_eq!(json["currentStep"], "ingested");
        assert_eq!(json["steps"]["tested"]["status"], "pending");
        assert_eq!(json["steps"]["tested"]["attempts"], 0);
        assert!(json["steps"]["tested"].get("startedAt").is_none());
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn in_progress_status_is_kebab_case() {
        let json = serde_json::to_string(&EntityStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn step_lifecycle_advances_and_finishes() {
        let mut entity = EntityRecord::new("p1", serde_json::Value::Null);
        for step in WorkflowStep::ALL {
            entity.begin_step(step);
            assert_eq!(entity.running_step(), Some(step));
            entity.complete_step(step, 5);
            entity.check_invariants().expect("invariants hold");
        }
        assert_eq!(entity.status, EntityStatus::Completed);
        assert_eq!(entity.current_step, WorkflowStep::Finalized);
        assert!(entity.all_steps_done());
        assert!(entity.steps.iter().all(|(_, r)| r.attempts == 1));
    }

    #[test]
    fn third_failure_blocks_entity() {
        let mut entity = EntityRecord::new("p2", serde_json::Value::Null);
        entity.begin_step(WorkflowStep::Ingested);
        entity.complete_step(WorkflowStep::Ingested, 1);

        for attempt in 1..=MAX_ATTEMPTS {
            entity.begin_step(WorkflowStep::Tested);
            entity.fail_step(WorkflowStep::Tested, "type error", 1);
            assert_eq!(entity.step(WorkflowStep::Tested).attempts, attempt);
        }
        assert_eq!(entity.status, EntityStatus::Blocked);
        assert_eq!(entity.errors.len(), 3);
        assert_eq!(entity.current_step, WorkflowStep::Tested);
    }

    #[test]
    fn settle_status_follows_first_open_step() {
        let mut entity = EntityRecord::new("p2", serde_json::Value::Null);
        entity.begin_step(WorkflowStep::Ingested);
        entity.complete_step(WorkflowStep::Ingested, 1);
        for _ in 0..MAX_ATTEMPTS {
            entity.begin_step(WorkflowStep::Tested);
            entity.fail_step(WorkflowStep::Tested, "type error", 1);
        }
        entity.step_mut(WorkflowStep::Published).attempts = 1;

        entity.settle_status();
        assert_eq!(entity.status, EntityStatus::Blocked);
        assert_eq!(entity.current_step, WorkflowStep::Tested);

        entity.step_mut(WorkflowStep::Tested).clear();
        entity.settle_status();
        assert_eq!(entity.status, EntityStatus::Ready);

        entity.step_mut(WorkflowStep::Ingested).clear();
        entity.settle_status();
        assert_eq!(entity.status, EntityStatus::Draft);
        assert_eq!(entity.current_step, WorkflowStep::Ingested);
    }

    #[test]
    fn reopen_keeps_attempts() {
        let mut entity = EntityRecord::new("p3", serde_json::Value::Null);
        entity.begin_step(WorkflowStep::Ingested);
        entity.fail_step(WorkflowStep::Ingested, "boom", 1);

        let rec = entity.step_mut(WorkflowStep::Ingested);
        rec.reopen();
        assert_eq!(rec.status, StepStatus::Pending);
        assert_eq!(rec.attempts, 1);
        assert!(rec.error.is_none());
        rec.clear();
        assert_eq!(rec.attempts, 0);
    }

    #[test]
    fn invariants_reject_gap_in_prefix() {
        let mut entity = EntityRecord::new("p3", serde_json::Value::Null);
        entity.step_mut(WorkflowStep::Validated).status = StepStatus::Completed;
        let err = entity.check_invariants().unwrap_err();
        assert!(err.contains("after an unfinished earlier step"));
    }

    #[test]
    fn invariants_reject_two_running_steps() {
        let mut entity = EntityRecord::new("p4", serde_json::Value::Null);
        entity.step_mut(WorkflowStep::Ingested).status = StepStatus::Running;
        entity.step_mut(WorkflowStep::Tested).status = StepStatus::Running;
        assert!(entity.check_invariants().unwrap_err().contains("2 steps are running"));
    }

    #[test]
    fn finalized_record_is_consistent() {
        let entity = EntityRecord::finalized("legacy/intro", serde_json::Value::Null);
        entity.check_invariants().expect("finalized record is valid");
        assert_eq!(entity.status, EntityStatus::Completed);
        assert!(entity.steps.iter().all(|(_, r)| r.attempts == 0));
    }

    #[test]
    fn document_validation_checks_version_and_keys() {
        let mut doc = Document::new();
        doc.validate().expect("empty document is valid");

        doc.version = "one".into();
        assert!(doc.validate().is_err());

        doc.version = "2.1.0-beta.1".into();
        doc.entities
            .insert("a".into(), EntityRecord::new("b", serde_json::Value::Null));
        assert!(doc.validate().unwrap_err().contains("stored under 'a'"));
    }

    #[test]
    fn missing_entity_is_not_found() {
        let doc = Document::new();
        let err = doc.entity("ghost").unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[test]
    fn document_fixture_validates() {
        let fixture = std::fs::read_to_string("../../../fixtures/json/state.fixture.json")
            .expect("read fixture");
        let parsed: Document = serde_json::from_str(&fixture).expect("deserialize fixture");
        parsed.validate().expect("fixture satisfies invariants");
        assert_eq!(parsed.entities.len(), 3);

        let p2 = parsed.entity("guides/p2").expect("p2 present");
        assert_eq!(p2.status, EntityStatus::Failed);
        assert_eq!(p2.step(WorkflowStep::Tested).error.as_deref(), Some("type error"));
        assert_eq!(parsed.global.step_history.len(), 2);
    }
}
