//! Operation lifecycle events and the in-process publisher.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use subsync_core::{DeprovisioningOperation, Operation};
use tracing::{debug, error};

/// Outcome of one step invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepProcessed {
    pub step_name: String,
    pub duration: Duration,
    /// Backoff requested by the step, zero when it does not need a retry.
    pub when: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    StepProcessed { step: StepProcessed, old: Operation, new: Operation },
    Succeeded(Operation),
    Finished { operation: Operation, plan_id: String },
    DeprovisioningSucceeded(DeprovisioningOperation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StepProcessed,
    Succeeded,
    Finished,
    DeprovisioningSucceeded,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [Self::StepProcessed, Self::Succeeded, Self::Finished, Self::DeprovisioningSucceeded];
}

impl OperationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StepProcessed { .. } => EventKind::StepProcessed,
            Self::Succeeded(_) => EventKind::Succeeded,
            Self::Finished { .. } => EventKind::Finished,
            Self::DeprovisioningSucceeded(_) => EventKind::DeprovisioningSucceeded,
        }
    }
}

pub trait Publisher: Send + Sync {
    fn publish(&self, event: OperationEvent);
}

pub type Handler = Arc<dyn Fn(&OperationEvent) -> anyhow::Result<()> + Send + Sync>;

/// Typed topics with synchronous delivery on the publishing task.
/// Subscribers doing slow work must hand it off themselves.
#[derive(Default)]
pub struct PubSub {
    handlers: Mutex<FxHashMap<EventKind, Vec<Handler>>>,
}

impl PubSub {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe(&self, kind: EventKind, handler: Handler) {
        let mut h = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        h.entry(kind).or_default().push(handler);
    }
}

impl Publisher for PubSub {
    fn publish(&self, event: OperationEvent) {
        let kind = event.kind();
        let list: Vec<Handler> = {
            let h = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            h.get(&kind).cloned().unwrap_or_default()
        };
        for handler in list {
            match handler(&event) {
                Ok(()) => debug!(event = ?kind, "event handled"),
                Err(e) => error!(event = ?kind, error = %e, "while calling event handler"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use subsync_core::{OperationType, ProvisioningParameters};

    #[test]
    fn delivers_to_matching_topic_only() {
        let bus = PubSub::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        bus.subscribe(
            EventKind::Finished,
            Arc::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.subscribe(EventKind::Finished, Arc::new(|_| Err(anyhow::anyhow!("handler failed"))));
        let op = Operation::new(OperationType::Provision, "i1", ProvisioningParameters::default());
        bus.publish(OperationEvent::Succeeded(op.clone()));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        bus.publish(OperationEvent::Finished { operation: op, plan_id: "p".into() });
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
