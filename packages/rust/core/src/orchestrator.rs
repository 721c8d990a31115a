//! Step-batch orchestrator.
//!
//! Drives every tracked entity through the fixed step sequence one step at a
//! time. Each step is a batch: the eligible entities are marked running and
//! saved, handed to a bounded pool of tokio tasks, and their outcomes are folded
//! back into the document before the next step starts.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use pubflow_shared::{
    Document, EntityStatus, MAX_ATTEMPTS, PipelineError, Result, RunConfig, RunId,
    StepHistoryEntry, WorkflowStep,
};
use pubflow_storage::StateStore;

use crate::checkpoint::{CheckpointEmitter, ops};
use crate::executor::{StepExecutor, StepOutcome, StepRouter};
use crate::retry::RetryController;

/// Worker pool size when none is configured.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a step batch is dispatched.
    fn step_started(&self, step: WorkflowStep, total: usize);
    /// Called as each entity of the batch finishes.
    fn entity_finished(
        &self,
        entity_id: &str,
        step: WorkflowStep,
        ok: bool,
        current: usize,
        total: usize,
    );
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn step_started(&self, _step: WorkflowStep, _total: usize) {}
    fn entity_finished(&self, _: &str, _: WorkflowStep, _: bool, _: usize, _: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

/// An entity that did not get past a step in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFailure {
    pub entity_id: String,
    pub step: WorkflowStep,
    pub attempts: u32,
    pub message: String,
}

impl EntityFailure {
    /// The failure as a [`PipelineError::StepExecution`].
    pub fn to_error(&self) -> PipelineError {
        PipelineError::StepExecution {
            entity_id: self.entity_id.clone(),
            step: self.step,
            attempts: self.attempts,
            message: self.message.clone(),
        }
    }
}

impl fmt::Display for EntityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} (attempt {}/{MAX_ATTEMPTS}): {}",
            self.entity_id, self.step, self.attempts, self.message
        )
    }
}

/// Result of one orchestrator run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    /// One entry per step batch that dispatched work, in step order.
    pub steps: Vec<StepHistoryEntry>,
    /// Entities whose step failed or whose attempts were exhausted.
    pub failures: Vec<EntityFailure>,
    /// Entities found with a step still `running` at the start of the run.
    pub stuck: Vec<EntityFailure>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn processed(&self) -> usize {
        self.steps.iter().map(|s| s.processed).sum()
    }

    pub fn succeeded(&self) -> usize {
        self.steps.iter().map(|s| s.succeeded).sum()
    }

    pub fn failed(&self) -> usize {
        self.steps.iter().map(|s| s.failed).sum()
    }

    /// No failures and nothing stuck.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.stuck.is_empty()
    }

    /// Stuck entities as [`PipelineError::StuckStep`] values.
    pub fn stuck_errors(&self) -> Vec<PipelineError> {
        self.stuck
            .iter()
            .map(|s| PipelineError::StuckStep {
                entity_id: s.entity_id.clone(),
                step: s.step,
                attempts: s.attempts,
            })
            .collect()
    }
}

/// Sole writer of the state document during a run.
pub struct Orchestrator {
    store: StateStore,
    executor: Arc<dyn StepExecutor>,
    emitter: CheckpointEmitter,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(store: StateStore, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            store,
            executor,
            emitter: CheckpointEmitter::new(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Wire the store, executors and audit sinks described by `config`.
    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            StateStore::open(&config.state_path),
            Arc::new(StepRouter::from_config(config)),
        )
        .with_concurrency(config.concurrency)
        .with_emitter(CheckpointEmitter::from_config(config))
    }

    /// Set the worker pool size. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_emitter(mut self, emitter: CheckpointEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run every pending step batch to completion.
    ///
    /// Only a corrupt document on load or a failed save aborts the run;
    /// executor failures are recorded on their entities.
    #[instrument(skip_all, fields(path = %self.store.path().display(), concurrency = self.concurrency))]
    pub async fn run(&self, progress: &dyn ProgressReporter) -> Result<RunSummary> {
        let start = Instant::now();
        let run_id = RunId::new();
        let mut doc = self.store.load()?;

        info!(%run_id, entities = doc.entities.len(), "starting run");

        let mut changed = false;
        let stuck = self.detect_stuck(&mut doc, &mut changed);
        let mut failures = Vec::new();
        let mut steps = Vec::new();

        for step in WorkflowStep::ALL {
            let eligible = self.select_eligible(&mut doc, step, &mut failures, &mut changed);
            if eligible.is_empty() {
                continue;
            }
            changed = true;

            let entry = self
                .run_step(&mut doc, step, &eligible, run_id, &mut failures, progress)
                .await?;
            steps.push(entry);
        }

        if changed {
            doc.global.current_step = None;
            self.save(&mut doc)?;
        }

        let summary = RunSummary {
            run_id,
            steps,
            failures,
            stuck,
            duration: start.elapsed(),
        };

        info!(
            %run_id,
            processed = summary.processed(),
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            stuck = summary.stuck.len(),
            duration_ms = millis(summary.duration),
            "run completed"
        );
        progress.done(&summary);
        Ok(summary)
    }

    /// Block every entity left with a `running` step by an interrupted run.
    fn detect_stuck(&self, doc: &mut Document, changed: &mut bool) -> Vec<EntityFailure> {
        let mut stuck = Vec::new();

        for entity in doc.entities.values_mut() {
            let Some(step) = entity.running_step() else {
                continue;
            };
            let attempts = entity.step(step).attempts;
            let error = PipelineError::StuckStep {
                entity_id: entity.id.clone(),
                step,
                attempts,
            };
            warn!(entity = %entity.id, %step, attempts, "{error}");

            if entity.status != EntityStatus::Blocked {
                entity.status = EntityStatus::Blocked;
                entity.touch();
                self.emitter.emit(
                    entity,
                    step,
                    ops::STUCK_DETECTED,
                    serde_json::json!({ "attempt": attempts }),
                );
                *changed = true;
            }

            stuck.push(EntityFailure {
                entity_id: entity.id.clone(),
                step,
                attempts,
                message: "step was left running by an interrupted run".into(),
            });
        }

        stuck
    }

    /// Entities pending at `step`. Those without attempts left are blocked instead.
    fn select_eligible(
        &self,
        doc: &mut Document,
        step: WorkflowStep,
        failures: &mut Vec<EntityFailure>,
        changed: &mut bool,
    ) -> Vec<String> {
        let mut eligible = Vec::new();

        for id in doc.pending_at(step) {
            let Some(entity) = doc.entities.get_mut(&id) else {
                continue;
            };
            if RetryController::has_attempts_left(entity, step) {
                eligible.push(id);
                continue;
            }

            let attempts = entity.step(step).attempts;
            entity.status = EntityStatus::Blocked;
            entity.touch();
            self.emitter.emit(
                entity,
                step,
                ops::ATTEMPTS_EXHAUSTED,
                serde_json::json!({ "attempts": attempts, "maxAttempts": MAX_ATTEMPTS }),
            );
            warn!(entity = %id, %step, attempts, "attempts exhausted, entity blocked");
            failures.push(EntityFailure {
                entity_id: id,
                step,
                attempts,
                message: "attempts exhausted".into(),
            });
            *changed = true;
        }

        eligible
    }

    /// Execute one step batch and fold the outcomes back into `doc`.
    async fn run_step(
        &self,
        doc: &mut Document,
        step: WorkflowStep,
        eligible: &[String],
        run_id: RunId,
        failures: &mut Vec<EntityFailure>,
        progress: &dyn ProgressReporter,
    ) -> Result<StepHistoryEntry> {
        let batch_start = Instant::now();
        let total = eligible.len();
        info!(%step, total, "starting step batch");
        progress.step_started(step, total);

        // Mark running and persist before any executor starts.
        let mut jobs = Vec::with_capacity(total);
        for id in eligible {
            let entity = doc.entity_mut(id)?;
            entity.begin_step(step);
            let attempt = entity.step(step).attempts;
            self.emitter.emit(
                entity,
                step,
                ops::STEP_STARTED,
                serde_json::json!({ "attempt": attempt, "runId": run_id }),
            );
            jobs.push((id.clone(), entity.metadata.clone()));
        }
        doc.global.current_step = Some(step);
        self.save(doc)?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles: Vec<(String, JoinHandle<(StepOutcome, u64)>)> = Vec::with_capacity(total);

        for (id, metadata) in jobs {
            let executor = self.executor.clone();
            let sem = semaphore.clone();
            let entity_id = id.clone();

            handles.push((
                id,
                tokio::spawn(async move {
                    let _permit = match sem.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => return (StepOutcome::failure(format!("worker pool closed: {e}")), 0),
                    };
                    let started = Instant::now();
                    let outcome = executor.execute(&entity_id, &metadata, step).await;
                    (outcome, millis(started.elapsed()))
                }),
            ));
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for (current, (id, handle)) in handles.into_iter().enumerate() {
            let (outcome, duration_ms) = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(entity = %id, %step, error = %e, "executor task did not finish");
                    (StepOutcome::failure(format!("executor task aborted: {e}")), 0)
                }
            };

            let entity = doc.entity_mut(&id)?;
            let attempt = entity.step(step).attempts;
            let ok = outcome.is_success();

            match outcome {
                StepOutcome::Succeeded { metrics } => {
                    entity.complete_step(step, duration_ms);
                    self.emitter.emit(
                        entity,
                        step,
                        ops::STEP_COMPLETED,
                        serde_json::json!({
                            "attempt": attempt,
                            "durationMs": duration_ms,
                            "metrics": metrics,
                        }),
                    );
                    debug!(entity = %id, %step, duration_ms, "step completed");
                    succeeded += 1;
                }
                StepOutcome::Failed { error_message } => {
                    entity.fail_step(step, &error_message, duration_ms);
                    let blocked = entity.status == EntityStatus::Blocked;
                    self.emitter.emit(
                        entity,
                        step,
                        ops::STEP_FAILED,
                        serde_json::json!({
                            "attempt": attempt,
                            "durationMs": duration_ms,
                            "error": error_message,
                            "blocked": blocked,
                        }),
                    );
                    let failure = EntityFailure {
                        entity_id: id.clone(),
                        step,
                        attempts: attempt,
                        message: error_message,
                    };
                    warn!(blocked, "{}", failure.to_error());
                    failures.push(failure);
                    failed += 1;
                }
            }

            progress.entity_finished(&id, step, ok, current + 1, total);
        }

        let entry = StepHistoryEntry {
            step,
            timestamp: Utc::now(),
            processed: total,
            succeeded,
            failed,
            duration_ms: millis(batch_start.elapsed()),
            run_id: Some(run_id),
        };
        self.emitter.record_batch(doc, entry.clone());
        self.save(doc)?;

        info!(%step, total, succeeded, failed, duration_ms = entry.duration_ms, "step batch finished");
        Ok(entry)
    }

    /// Save `doc`, then release its checkpoints to the audit sinks.
    fn save(&self, doc: &mut Document) -> Result<()> {
        match self.store.save(doc) {
            Ok(()) => {
                self.emitter.flush();
                Ok(())
            }
            Err(e) => {
                self.emitter.discard();
                Err(e)
            }
        }
    }
}

/// Whole milliseconds, saturating.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
