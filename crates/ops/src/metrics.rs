//! Operation metrics: an event collector and a periodic gauge refresher.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use subsync_persist::Operations;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventKind, OperationEvent, PubSub};

/// Subscribe the collector to every event kind.
pub fn register_collector(bus: &PubSub) {
    for kind in EventKind::ALL {
        bus.subscribe(kind, Arc::new(|ev| {
            collect(ev);
            Ok(())
        }));
    }
}

pub fn collect(event: &OperationEvent) {
    match event {
        OperationEvent::StepProcessed { step, .. } => {
            let result = if step.error.is_some() { "error" } else if step.when.is_zero() { "done" } else { "retry" };
            counter!("operations_step_processed_total", 1u64, "step" => step.step_name.clone(), "result" => result);
            histogram!("operations_step_duration_seconds", step.duration.as_secs_f64(), "step" => step.step_name.clone());
        }
        OperationEvent::Succeeded(op) => {
            counter!("operations_succeeded_total", 1u64, "type" => op.kind.as_str());
        }
        OperationEvent::Finished { operation, plan_id } => {
            counter!(
                "operations_finished_total", 1u64,
                "type" => operation.kind.as_str(),
                "state" => operation.state.as_str(),
                "plan" => plan_id.clone()
            );
        }
        OperationEvent::DeprovisioningSucceeded(_) => {
            counter!("operations_deprovisioning_succeeded_total", 1u64);
        }
    }
}

type StatsKey = (String, String, String);

/// Keeps `operations_count{type,state,plan}` in line with the store.
pub struct OperationStats {
    storage: Arc<dyn Operations>,
    last: Mutex<FxHashMap<StatsKey, u64>>,
}

impl OperationStats {
    pub fn new(storage: Arc<dyn Operations>) -> Self { Self { storage, last: Mutex::new(FxHashMap::default()) } }

    /// Recompute the gauges. Keys reported on the previous refresh but absent now are set to zero.
    pub fn refresh(&self) -> anyhow::Result<FxHashMap<StatsKey, u64>> {
        let mut now: FxHashMap<StatsKey, u64> = FxHashMap::default();
        for c in self.storage.count_by_type_state_plan()? {
            now.insert((c.kind.as_str().to_string(), c.state.as_str().to_string(), c.plan_id), c.count);
        }
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        for key in last.keys() {
            if !now.contains_key(key) {
                now.insert(key.clone(), 0);
            }
        }
        for ((kind, state, plan), n) in &now {
            gauge!("operations_count", *n as f64, "type" => kind.clone(), "state" => state.clone(), "plan" => plan.clone());
        }
        // zeroed keys are reported once
        *last = now.iter().filter(|(_, n)| **n > 0).map(|(k, n)| (k.clone(), *n)).collect();
        debug!(keys = now.len(), "operation stats refreshed");
        Ok(now)
    }

    pub async fn run(self, every: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.refresh() {
                        warn!(error = %e, "while refreshing operation stats");
                    }
                }
            }
        }
    }
}
