//! Query and administrative operations on the state document.
//!
//! Every mutating operation loads the document, applies its change in memory
//! and saves only when the change succeeded, so a rejected operation never
//! touches the file.

use std::collections::BTreeMap;

use chrono::Utc;
use regex::Regex;
use tracing::{info, instrument, warn};

use pubflow_shared::{
    Document, EntityRecord, EntityStatus, MAX_ATTEMPTS, PipelineError, Result, StepHistoryEntry,
    StepStatus, WorkflowStep,
};
use pubflow_storage::StateStore;

use crate::checkpoint::{CheckpointEmitter, ops};
use crate::migrate::{self, ContentItem};
use crate::retry::RetryController;

/// Which entities an operation applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityTarget {
    One(String),
    All,
}

/// Selection for [`Admin::reset`].
#[derive(Debug, Clone, Default)]
pub struct ResetFilter {
    /// Glob over entity ids: `*` within a segment, `**` across segments, `?` one char.
    pub pattern: Option<String>,
    /// Only entities whose status is failed or blocked.
    pub only_failed: bool,
}

/// An entity an operation left alone, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntity {
    pub entity_id: String,
    pub reason: String,
}

/// Outcome of an administrative operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationReport {
    pub message: String,
    /// Entities the operation changed.
    pub entities: Vec<String>,
    pub skipped: Vec<SkippedEntity>,
}

impl OperationReport {
    fn new(message: impl Into<String>, entities: Vec<String>) -> Self {
        Self {
            message: message.into(),
            entities,
            skipped: Vec::new(),
        }
    }
}

/// Whole-pipeline overview.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub total: usize,
    pub by_status: BTreeMap<EntityStatus, usize>,
    /// Current step of every entity that is not completed.
    pub by_step: BTreeMap<WorkflowStep, usize>,
    /// Entities with a step left `running`.
    pub stuck: Vec<String>,
    /// Failed and blocked entities with their current step.
    pub attention: Vec<(String, WorkflowStep, EntityStatus)>,
    pub last_batch: Option<StepHistoryEntry>,
}

/// Result of [`Admin::status`].
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    Entity(Box<EntityRecord>),
    Summary(PipelineSummary),
}

/// An entity that a run would pick up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeEntry {
    pub entity_id: String,
    pub step: WorkflowStep,
}

/// Result of [`Admin::resume`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeReport {
    pub message: String,
    pub ready: Vec<ResumeEntry>,
    /// Entities that need `complete` or `fail` before they can continue.
    pub stuck: Vec<String>,
}

/// Administrative entry points over a [`StateStore`].
pub struct Admin {
    store: StateStore,
    emitter: CheckpointEmitter,
}

impl Admin {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            emitter: CheckpointEmitter::new(),
        }
    }

    pub fn with_emitter(mut self, emitter: CheckpointEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// One entity's record, or a summary of the whole pipeline.
    #[instrument(skip(self))]
    pub fn status(&self, entity_id: Option<&str>) -> Result<StatusReport> {
        let doc = self.store.load()?;

        if let Some(id) = entity_id {
            return Ok(StatusReport::Entity(Box::new(doc.entity(id)?.clone())));
        }

        let mut summary = PipelineSummary {
            total: doc.entities.len(),
            by_status: BTreeMap::new(),
            by_step: BTreeMap::new(),
            stuck: Vec::new(),
            attention: Vec::new(),
            last_batch: doc.global.step_history.last().cloned(),
        };
        for entity in doc.entities.values() {
            *summary.by_status.entry(entity.status).or_default() += 1;
            if entity.status != EntityStatus::Completed {
                *summary.by_step.entry(entity.current_step).or_default() += 1;
            }
            if entity.running_step().is_some() {
                summary.stuck.push(entity.id.clone());
            }
            if matches!(entity.status, EntityStatus::Failed | EntityStatus::Blocked) {
                summary
                    .attention
                    .push((entity.id.clone(), entity.current_step, entity.status));
            }
        }
        Ok(StatusReport::Summary(summary))
    }

    /// Entities whose current step is pending and would continue on the next run.
    #[instrument(skip(self))]
    pub fn resume(&self) -> Result<ResumeReport> {
        let doc = self.store.load()?;

        let ready: Vec<ResumeEntry> = doc
            .entities
            .values()
            .filter(|e| e.is_pending_at(e.current_step))
            .map(|e| ResumeEntry {
                entity_id: e.id.clone(),
                step: e.current_step,
            })
            .collect();
        let stuck: Vec<String> = doc
            .entities
            .values()
            .filter(|e| e.running_step().is_some())
            .map(|e| e.id.clone())
            .collect();

        let mut message = format!("{} entities ready to continue", ready.len());
        if !stuck.is_empty() {
            message.push_str(&format!(
                "; {} stuck, resolve with complete or fail",
                stuck.len()
            ));
        }
        Ok(ResumeReport {
            message,
            ready,
            stuck,
        })
    }

    /// Retry `step` for one entity, or for every entity failed at it.
    #[instrument(skip(self))]
    pub fn retry(&self, step: &str, entity_id: Option<&str>, all: bool) -> Result<OperationReport> {
        let target = match (entity_id, all) {
            (Some(id), false) => EntityTarget::One(id.to_string()),
            (None, true) => EntityTarget::All,
            _ => {
                return Err(PipelineError::invalid_transition(
                    entity_id.unwrap_or("*"),
                    step,
                    "retry needs exactly one of an entity id or all",
                ));
            }
        };
        let step = parse_step(entity_id.unwrap_or("*"), step)?;
        let controller = RetryController::new(self.emitter.clone());
        let mut doc = self.store.load()?;

        let report = match target {
            EntityTarget::One(id) => {
                controller.retry(&mut doc, &id, step)?;
                OperationReport::new(format!("{id} queued for retry at {step}"), vec![id])
            }
            EntityTarget::All => {
                let mut accepted = Vec::new();
                let mut skipped = Vec::new();
                for outcome in controller.retry_all(&mut doc, step) {
                    match outcome.result {
                        Ok(()) => accepted.push(outcome.entity_id),
                        Err(e) => skipped.push(SkippedEntity {
                            entity_id: outcome.entity_id,
                            reason: e.to_string(),
                        }),
                    }
                }
                let mut report = OperationReport::new(
                    format!(
                        "{} of {} failed entities queued for retry at {step}",
                        accepted.len(),
                        accepted.len() + skipped.len()
                    ),
                    accepted,
                );
                report.skipped = skipped;
                report
            }
        };

        self.save_if_changed(&mut doc, &report)?;
        Ok(report)
    }

    /// Skip every unfinished step before `step` and reopen `step` onwards.
    ///
    /// Attempt counters are kept; a target step with no attempts left is refused.
    #[instrument(skip(self))]
    pub fn skip_to(&self, step: &str, target: EntityTarget) -> Result<OperationReport> {
        let label = match &target {
            EntityTarget::One(id) => id.as_str(),
            EntityTarget::All => "*",
        };
        let step = parse_step(label, step)?;
        let mut doc = self.store.load()?;

        let report = match target {
            EntityTarget::One(id) => {
                let entity = doc.entity_mut(&id)?;
                if let Some(running) = entity.running_step() {
                    return Err(PipelineError::StuckStep {
                        entity_id: id,
                        step: running,
                        attempts: entity.step(running).attempts,
                    });
                }
                let attempts = entity.step(step).attempts;
                if attempts >= MAX_ATTEMPTS {
                    return Err(PipelineError::RetryLimitExceeded {
                        entity_id: id,
                        step,
                        attempts,
                        max: MAX_ATTEMPTS,
                    });
                }
                self.apply_skip_to(entity, step);
                OperationReport::new(format!("{id} moved to {step}"), vec![id])
            }
            EntityTarget::All => {
                let mut moved = Vec::new();
                let mut skipped = Vec::new();
                for entity in doc.entities.values_mut() {
                    if entity.status == EntityStatus::Completed || entity.current_step >= step {
                        continue;
                    }
                    if let Some(running) = entity.running_step() {
                        skipped.push(SkippedEntity {
                            entity_id: entity.id.clone(),
                            reason: format!("step {running} is running"),
                        });
                        continue;
                    }
                    self.apply_skip_to(entity, step);
                    moved.push(entity.id.clone());
                }
                let mut report =
                    OperationReport::new(format!("{} entities moved to {step}", moved.len()), moved);
                report.skipped = skipped;
                report
            }
        };

        self.save_if_changed(&mut doc, &report)?;
        Ok(report)
    }

    fn apply_skip_to(&self, entity: &mut EntityRecord, step: WorkflowStep) {
        for earlier in step.predecessors() {
            if entity.step(earlier).status.is_done() {
                continue;
            }
            let rec = entity.step_mut(earlier);
            rec.status = StepStatus::Skipped;
            rec.error = None;
            self.emitter.emit(
                entity,
                earlier,
                ops::STEP_SKIPPED,
                serde_json::json!({ "skipTo": step }),
            );
        }
        for later in step.from_here() {
            entity.step_mut(later).reopen();
        }
        entity.current_step = step;
        entity.status = EntityStatus::Ready;
        entity.touch();
    }

    /// Force `step` and every later step back to pending for matching entities.
    ///
    /// Clears attempt counters, so this bypasses the retry limit.
    #[instrument(skip(self))]
    pub fn reset(&self, step: &str, filter: &ResetFilter) -> Result<OperationReport> {
        let step = parse_step("*", step)?;
        let matcher = match &filter.pattern {
            Some(pattern) => Some(glob_to_regex(pattern).ok_or_else(|| {
                PipelineError::invalid_transition("*", step, format!("invalid filter '{pattern}'"))
            })?),
            None => None,
        };
        let mut doc = self.store.load()?;

        let mut changed = Vec::new();
        let mut skipped = Vec::new();
        for entity in doc.entities.values_mut() {
            if matcher.as_ref().is_some_and(|re| !re.is_match(&entity.id)) {
                continue;
            }
            if filter.only_failed
                && !matches!(entity.status, EntityStatus::Failed | EntityStatus::Blocked)
            {
                continue;
            }
            let failed_before = entity
                .first_open_step()
                .filter(|open| *open < step && entity.step(*open).status == StepStatus::Failed);
            if let Some(open) = failed_before {
                skipped.push(SkippedEntity {
                    entity_id: entity.id.clone(),
                    reason: format!("step {open} failed before {step}, retry or reset from {open}"),
                });
                continue;
            }
            if !needs_reset(entity, step) {
                continue;
            }
            if let Some(running) = entity.running_step().filter(|r| *r < step) {
                skipped.push(SkippedEntity {
                    entity_id: entity.id.clone(),
                    reason: format!("step {running} is running"),
                });
                continue;
            }

            let previous = entity.step(step).clone();
            for later in step.from_here() {
                entity.step_mut(later).clear();
            }
            entity.settle_status();
            entity.touch();
            self.emitter.emit(
                entity,
                step,
                ops::STEP_RESET,
                serde_json::json!({
                    "previousStatus": previous.status,
                    "previousAttempts": previous.attempts,
                }),
            );
            changed.push(entity.id.clone());
        }

        let mut report = OperationReport::new(
            format!("{} entities reset from {step}", changed.len()),
            changed,
        );
        report.skipped = skipped;
        if !report.entities.is_empty() {
            warn!(step = %step, count = report.entities.len(), "attempt counters force-cleared");
        }
        self.save_if_changed(&mut doc, &report)?;
        Ok(report)
    }

    /// Force the entity's running step to completed.
    #[instrument(skip(self))]
    pub fn complete(&self, entity_id: &str) -> Result<OperationReport> {
        let mut doc = self.store.load()?;
        let entity = doc.entity_mut(entity_id)?;
        let step = running_or_reject(entity, "complete")?;

        let duration_ms = elapsed_since_start(entity, step);
        entity.complete_step(step, duration_ms);
        self.emitter
            .emit(entity, step, ops::FORCE_COMPLETED, serde_json::json!({ "durationMs": duration_ms }));

        let report = OperationReport::new(
            format!("{entity_id} completed {step}"),
            vec![entity_id.to_string()],
        );
        self.save_if_changed(&mut doc, &report)?;
        Ok(report)
    }

    /// Force the entity's running step to failed with `reason`.
    #[instrument(skip(self))]
    pub fn fail(&self, entity_id: &str, reason: &str) -> Result<OperationReport> {
        let mut doc = self.store.load()?;
        let entity = doc.entity_mut(entity_id)?;
        let step = running_or_reject(entity, "fail")?;

        let duration_ms = elapsed_since_start(entity, step);
        entity.fail_step(step, reason, duration_ms);
        let attempts = entity.step(step).attempts;
        self.emitter.emit(
            entity,
            step,
            ops::FORCE_FAILED,
            serde_json::json!({ "reason": reason, "attempt": attempts }),
        );

        let report = OperationReport::new(
            format!("{entity_id} failed {step} (attempt {attempts}): {reason}"),
            vec![entity_id.to_string()],
        );
        self.save_if_changed(&mut doc, &report)?;
        Ok(report)
    }

    /// Start tracking a newly discovered entity.
    #[instrument(skip(self, metadata))]
    pub fn register(&self, entity_id: &str, metadata: serde_json::Value) -> Result<OperationReport> {
        if entity_id.trim().is_empty() {
            return Err(PipelineError::invalid_transition(
                entity_id,
                WorkflowStep::Ingested,
                "entity id must not be empty",
            ));
        }
        let mut doc = self.store.load()?;
        if doc.entities.contains_key(entity_id) {
            return Err(PipelineError::invalid_transition(
                entity_id,
                WorkflowStep::Ingested,
                "entity is already tracked",
            ));
        }

        let mut entity = EntityRecord::new(entity_id, metadata);
        self.emitter
            .emit(&mut entity, WorkflowStep::Ingested, ops::REGISTERED, serde_json::Value::Null);
        doc.entities.insert(entity_id.to_string(), entity);

        let report = OperationReport::new(
            format!("{entity_id} registered"),
            vec![entity_id.to_string()],
        );
        self.save_if_changed(&mut doc, &report)?;
        Ok(report)
    }

    /// Track pre-existing content as already finalized.
    #[instrument(skip_all, fields(items = items.len()))]
    pub fn migrate(&self, items: Vec<ContentItem>) -> Result<OperationReport> {
        let mut doc = self.store.load()?;
        let outcome = migrate::insert_finalized(&mut doc, &self.emitter, items);

        let mut report = OperationReport::new(
            format!(
                "{} entities migrated, {} already tracked",
                outcome.added.len(),
                outcome.skipped.len()
            ),
            outcome.added,
        );
        report.skipped = outcome
            .skipped
            .into_iter()
            .map(|entity_id| SkippedEntity {
                entity_id,
                reason: "already tracked".into(),
            })
            .collect();
        self.save_if_changed(&mut doc, &report)?;
        Ok(report)
    }

    /// Persist a successful change, then release its checkpoints to the audit sinks.
    fn save_if_changed(&self, doc: &mut Document, report: &OperationReport) -> Result<()> {
        if report.entities.is_empty() {
            self.emitter.discard();
            return Ok(());
        }
        if let Err(e) = self.store.save(doc) {
            self.emitter.discard();
            return Err(e);
        }
        self.emitter.flush();
        info!(changed = report.entities.len(), "{}", report.message);
        Ok(())
    }
}

fn parse_step(entity_id: &str, step: &str) -> Result<WorkflowStep> {
    step.parse::<WorkflowStep>()
        .map_err(|e| PipelineError::invalid_transition(entity_id, step, format!("{e}")))
}

fn running_or_reject(entity: &EntityRecord, action: &str) -> Result<WorkflowStep> {
    entity.running_step().ok_or_else(|| {
        PipelineError::invalid_transition(
            &entity.id,
            entity.current_step,
            format!("{action} requires a running step, found {}", entity.step(entity.current_step).status),
        )
    })
}

fn elapsed_since_start(entity: &EntityRecord, step: WorkflowStep) -> u64 {
    entity
        .step(step)
        .started_at
        .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

/// Whether any record from `step` onwards carries state a reset would clear.
fn needs_reset(entity: &EntityRecord, step: WorkflowStep) -> bool {
    step.from_here().any(|s| {
        let rec = entity.step(s);
        rec.status != StepStatus::Pending || rec.attempts > 0 || rec.error.is_some()
    })
}

/// Convert a glob-like pattern to a regex.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).ok()
}
