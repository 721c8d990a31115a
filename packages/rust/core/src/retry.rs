//! Retry rules for failed steps.
//!
//! A retry only moves a `failed` step back to `pending`; the attempt counter is
//! bumped when the orchestrator actually executes the step again.

use tracing::{debug, info};

use pubflow_shared::{
    Document, EntityRecord, EntityStatus, MAX_ATTEMPTS, PipelineError, Result, StepStatus,
    WorkflowStep,
};

use crate::checkpoint::{CheckpointEmitter, ops};

/// Per-entity result of [`RetryController::retry_all`].
#[derive(Debug)]
pub struct RetryOutcome {
    pub entity_id: String,
    pub result: Result<()>,
}

/// Validates and applies retry requests against the attempt limit.
///
/// Checkpoints are queued on the emitter; the caller flushes it after saving.
#[derive(Clone, Default)]
pub struct RetryController {
    emitter: CheckpointEmitter,
}

impl RetryController {
    pub fn new(emitter: CheckpointEmitter) -> Self {
        Self { emitter }
    }

    /// Whether `step` may still be executed for `entity`.
    pub fn has_attempts_left(entity: &EntityRecord, step: WorkflowStep) -> bool {
        entity.step(step).attempts < MAX_ATTEMPTS
    }

    /// Check that `step` of `entity` may be retried, without changing anything.
    pub fn check(entity: &EntityRecord, step: WorkflowStep) -> Result<()> {
        let rec = entity.step(step);
        if rec.status != StepStatus::Failed {
            return Err(PipelineError::invalid_transition(
                &entity.id,
                step,
                format!("retry requires a failed step, found {}", rec.status),
            ));
        }
        if !Self::has_attempts_left(entity, step) {
            return Err(PipelineError::RetryLimitExceeded {
                entity_id: entity.id.clone(),
                step,
                attempts: rec.attempts,
                max: MAX_ATTEMPTS,
            });
        }
        Ok(())
    }

    /// Move a failed step back to `pending` so the next run executes it.
    pub fn retry(&self, doc: &mut Document, entity_id: &str, step: WorkflowStep) -> Result<()> {
        let entity = doc.entity_mut(entity_id)?;
        Self::check(entity, step)?;

        let rec = entity.step_mut(step);
        rec.status = StepStatus::Pending;
        rec.error = None;
        let attempts = rec.attempts;

        entity.current_step = step;
        entity.status = EntityStatus::Ready;
        entity.touch();
        self.emitter.emit(
            entity,
            step,
            ops::RETRY_REQUESTED,
            serde_json::json!({ "attemptsUsed": attempts, "maxAttempts": MAX_ATTEMPTS }),
        );

        debug!(entity = %entity_id, %step, attempts, "step queued for retry");
        Ok(())
    }

    /// Retry every entity currently failed at `step`. Never stops at the first refusal.
    pub fn retry_all(&self, doc: &mut Document, step: WorkflowStep) -> Vec<RetryOutcome> {
        let failed: Vec<String> = doc
            .entities
            .values()
            .filter(|e| e.step(step).status == StepStatus::Failed)
            .map(|e| e.id.clone())
            .collect();

        let outcomes: Vec<RetryOutcome> = failed
            .into_iter()
            .map(|entity_id| {
                let result = self.retry(doc, &entity_id, step);
                RetryOutcome { entity_id, result }
            })
            .collect();

        info!(
            %step,
            requested = outcomes.len(),
            accepted = outcomes.iter().filter(|o| o.result.is_ok()).count(),
            "bulk retry applied"
        );
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An entity that has failed `tested` `attempts` times.
    fn failed_at_tested(id: &str, attempts: u32) -> EntityRecord {
        let mut entity = EntityRecord::new(id, serde_json::Value::Null);
        entity.begin_step(WorkflowStep::Ingested);
        entity.complete_step(WorkflowStep::Ingested, 1);
        for _ in 0..attempts {
            entity.begin_step(WorkflowStep::Tested);
            entity.fail_step(WorkflowStep::Tested, "type error", 1);
        }
        entity
    }

    fn doc_with(entities: Vec<EntityRecord>) -> Document {
        let mut doc = Document::new();
        for e in entities {
            doc.entities.insert(e.id.clone(), e);
        }
        doc
    }

    #[test]
    fn retry_moves_failed_to_pending_without_counting() {
        let mut doc = doc_with(vec![failed_at_tested("p2", 1)]);
        let controller = RetryController::default();

        controller
            .retry(&mut doc, "p2", WorkflowStep::Tested)
            .expect("retry accepted");

        let p2 = doc.entity("p2").expect("p2");
        let tested = p2.step(WorkflowStep::Tested);
        assert_eq!(tested.status, StepStatus::Pending);
        assert_eq!(tested.attempts, 1);
        assert!(tested.error.is_none());
        assert_eq!(p2.status, EntityStatus::Ready);
        assert!(p2.is_pending_at(WorkflowStep::Tested));
        assert_eq!(tested.checkpoints.last().map(|c| c.operation.as_str()), Some("retry-requested"));
        p2.check_invariants().expect("still consistent");
    }

    #[test]
    fn retry_at_limit_is_refused_without_mutation() {
        let mut doc = doc_with(vec![failed_at_tested("p3", MAX_ATTEMPTS)]);
        let before = doc.clone();

        let err = RetryController::default()
            .retry(&mut doc, "p3", WorkflowStep::Tested)
            .unwrap_err();

        assert!(matches!(err, PipelineError::RetryLimitExceeded { attempts: 3, .. }));
        assert_eq!(doc, before);
    }

    #[test]
    fn retry_on_non_failed_step_is_invalid() {
        let mut doc = doc_with(vec![failed_at_tested("p2", 1)]);
        let err = RetryController::default()
            .retry(&mut doc, "p2", WorkflowStep::Ingested)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }

    #[test]
    fn retry_unknown_entity_is_not_found() {
        let mut doc = Document::new();
        let err = RetryController::default()
            .retry(&mut doc, "ghost", WorkflowStep::Tested)
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[test]
    fn retry_all_reports_each_entity() {
        let mut doc = doc_with(vec![
            failed_at_tested("a", 1),
            failed_at_tested("b", MAX_ATTEMPTS),
            failed_at_tested("c", 2),
            EntityRecord::new("d", serde_json::Value::Null),
        ]);

        let outcomes = RetryController::default().retry_all(&mut doc, WorkflowStep::Tested);

        assert_eq!(outcomes.len(), 3);
        let refused: Vec<_> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.entity_id.as_str())
            .collect();
        assert_eq!(refused, vec!["b"]);
        assert_eq!(doc.pending_at(WorkflowStep::Tested), vec!["a".to_string(), "c".to_string()]);
    }
}
