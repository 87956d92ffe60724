//! State transition helpers used by steps.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use subsync_core::{Operation, OperationState};
use subsync_persist::{Operations, PersistError};
use tracing::{info, warn};

use crate::step::StepOutcome;

/// Delay returned when persisting an operation fails.
pub const STORAGE_RETRY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct OperationManager {
    storage: Arc<dyn Operations>,
}

impl OperationManager {
    pub fn new(storage: Arc<dyn Operations>) -> Self { Self { storage } }

    pub fn operation_succeeded(&self, op: Operation, description: &str) -> StepOutcome {
        self.transition(op, OperationState::Succeeded, description)
    }

    /// Mark the operation failed. The outcome always carries an error so the
    /// caller records it as the last error.
    pub fn operation_failed(&self, op: Operation, description: &str, err: Option<anyhow::Error>) -> StepOutcome {
        let mut out = self.transition(op, OperationState::Failed, description);
        let cause = match err {
            Some(e) => e.context(description.to_string()),
            None => anyhow!("{description}"),
        };
        out.error = Some(cause);
        out.backoff = Duration::ZERO;
        out
    }

    pub fn operation_canceled(&self, op: Operation, description: &str) -> StepOutcome {
        self.transition(op, OperationState::Canceled, description)
    }

    /// Retry every `retry_interval` until `max_time` has passed since the last update, then fail.
    pub fn retry_operation(
        &self,
        op: Operation,
        message: &str,
        err: anyhow::Error,
        retry_interval: Duration,
        max_time: Duration,
    ) -> StepOutcome {
        let elapsed = since(&op);
        if elapsed < max_time {
            warn!(operation = %op.id, error = %err, elapsed = ?elapsed, "{message}, retrying");
            return StepOutcome::retry(op, retry_interval);
        }
        self.operation_failed(op, message, Some(err))
    }

    /// Wait once for `wait` since the last update, then fail.
    pub fn retry_operation_once(&self, op: Operation, message: &str, err: anyhow::Error, wait: Duration) -> StepOutcome {
        let elapsed = since(&op);
        if elapsed < wait {
            return StepOutcome::retry(op, wait - elapsed);
        }
        self.operation_failed(op, message, Some(err))
    }

    /// Apply `f` and persist. On a version conflict the stored copy is reloaded and `f` re-applied.
    /// Storage errors yield a one minute retry with the unchanged operation.
    pub fn update_operation(&self, op: Operation, f: impl Fn(&mut Operation)) -> StepOutcome {
        let mut next = op.clone();
        f(&mut next);
        match self.storage.update_operation(next) {
            Ok(saved) => StepOutcome::next(saved),
            Err(PersistError::Conflict { .. }) => {
                let fresh = match self.storage.get_operation_by_id(&op.id) {
                    Ok(o) => o,
                    Err(e) => {
                        warn!(operation = %op.id, error = %e, "while reloading operation after conflict");
                        return StepOutcome::retry(op, STORAGE_RETRY);
                    }
                };
                let mut merged = fresh;
                f(&mut merged);
                match self.storage.update_operation(merged) {
                    Ok(saved) => StepOutcome::next(saved),
                    Err(e) => {
                        warn!(operation = %op.id, error = %e, "while updating operation");
                        StepOutcome::retry(op, STORAGE_RETRY)
                    }
                }
            }
            Err(e) => {
                warn!(operation = %op.id, error = %e, "while updating operation");
                StepOutcome::retry(op, STORAGE_RETRY)
            }
        }
    }

    fn transition(&self, op: Operation, state: OperationState, description: &str) -> StepOutcome {
        info!(operation = %op.id, state = %state, "{description}");
        self.update_operation(op, |o| {
            o.state = state;
            o.description = description.to_string();
        })
    }
}

fn since(op: &Operation) -> Duration { (Utc::now() - op.updated_at).to_std().unwrap_or_default() }
