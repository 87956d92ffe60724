use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use subsync_core::Operation;

/// Result of one step run: the possibly updated operation, a requested
/// backoff and an optional error.
#[derive(Debug)]
pub struct StepOutcome {
    pub operation: Operation,
    pub backoff: Duration,
    pub error: Option<anyhow::Error>,
}

impl StepOutcome {
    /// Step is done; continue with the next one.
    pub fn next(operation: Operation) -> Self { Self { operation, backoff: Duration::ZERO, error: None } }

    pub fn retry(operation: Operation, after: Duration) -> Self { Self { operation, backoff: after, error: None } }

    pub fn error(operation: Operation, error: anyhow::Error) -> Self { Self { operation, backoff: Duration::ZERO, error: Some(error) } }

    pub fn needs_retry(&self) -> bool { self.error.is_none() && !self.backoff.is_zero() }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, operation: Operation) -> StepOutcome;
}

/// Predicate deciding whether a step applies to an operation.
pub type StepCondition = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;
