//! Subsync apply: the single writer draining the priority queue into label updates.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use subsync_core::{QueueElement, BETA_ENABLED_LABEL};
use subsync_kubehub::ResourceApi;
use subsync_store::SubaccountPriorityQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Outcome of one queue pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Queue was empty.
    Idle,
    /// Every resource of the subaccount carries the desired label.
    Updated { subaccount: String, resources: usize },
    /// Listing or at least one update failed; the element went back to the queue.
    Requeued { subaccount: String },
    /// No resources matched; the element was dropped.
    NoResources { subaccount: String },
}

pub struct Updater {
    api: Arc<dyn ResourceApi>,
    queue: Arc<SubaccountPriorityQueue>,
    sleep: Duration,
    label: String,
}

impl Updater {
    pub fn new(api: Arc<dyn ResourceApi>, queue: Arc<SubaccountPriorityQueue>, sleep: Duration) -> Self {
        Self { api, queue, sleep, label: BETA_ENABLED_LABEL.to_string() }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Extract one element and bring its resources in line.
    pub async fn process_next(&self) -> Processed {
        let Some(item) = self.queue.extract() else {
            return Processed::Idle;
        };
        let t0 = Instant::now();
        let subaccount = item.subaccount_id.to_string();
        let resources = match self.api.list_by_subaccount(&item.subaccount_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(subaccount = %subaccount, error = %e, "while listing resources, adding item back to the queue");
                self.requeue(item);
                return Processed::Requeued { subaccount };
            }
        };
        if resources.is_empty() {
            info!(subaccount = %subaccount, "no resources found for subaccount");
            return Processed::NoResources { subaccount };
        }
        let mut retry = false;
        for r in &resources {
            if let Err(e) = self.api.set_label(r, &self.label, &item.beta_enabled).await {
                warn!(subaccount = %subaccount, resource = %r.name, error = %e, "while updating resource, item will be added back to the queue");
                counter!("subaccount_sync_resource_updates", 1u64, "result" => "failure");
                retry = true;
            } else {
                counter!("subaccount_sync_resource_updates", 1u64, "result" => "success");
            }
        }
        histogram!("subaccount_sync_update_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if retry {
            self.requeue(item);
            return Processed::Requeued { subaccount };
        }
        debug!(subaccount = %subaccount, beta_enabled = %item.beta_enabled, count = resources.len(), "resources updated");
        Processed::Updated { subaccount, resources: resources.len() }
    }

    fn requeue(&self, item: QueueElement) { self.queue.insert(item); }

    /// Drain the queue until cancelled. Sleeps when idle and after a failed attempt.
    pub async fn run(self, cancel: CancellationToken) {
        let span = info_span!("updater", component = "updater");
        async move {
            info!("updater started");
            while !cancel.is_cancelled() {
                match self.process_next().await {
                    Processed::Idle | Processed::Requeued { .. } => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.sleep) => {}
                        }
                    }
                    Processed::Updated { .. } | Processed::NoResources { .. } => {}
                }
            }
            info!("updater stopped");
        }
        .instrument(span)
        .await
    }
}
