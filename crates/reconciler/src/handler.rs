use std::sync::Arc;

use subsync_core::{RuntimeId, RuntimeState, SubaccountId};
use subsync_kubehub::{ResourceEvent, ResourceObject};
use subsync_persist::Instances;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::metrics;
use crate::state::StateReconciler;

/// Feeds informer notifications into the reconciler.
pub struct InformerHandler {
    reconciler: Arc<StateReconciler>,
    instances: Arc<dyn Instances>,
    always_from_db: bool,
}

impl InformerHandler {
    pub fn new(reconciler: Arc<StateReconciler>, instances: Arc<dyn Instances>, always_from_db: bool) -> Self {
        Self { reconciler, instances, always_from_db }
    }

    /// Subaccount of a resource: the label, or the instances table when the
    /// label is missing or the table is configured as the source of truth.
    async fn resolve(&self, obj: &ResourceObject) -> Option<(SubaccountId, RuntimeId)> {
        let runtime = obj.runtime_id()?;
        let label = obj.subaccount_id();
        if !self.always_from_db {
            if let Some(id) = label {
                return Some((id, runtime));
            }
        }
        let instances = self.instances.clone();
        let lookup = runtime.clone();
        // the instances store is synchronous
        let found = tokio::task::spawn_blocking(move || instances.subaccount_for_runtime(&lookup)).await;
        match found {
            Ok(Ok(Some(id))) => Some((id, runtime)),
            Ok(Ok(None)) => {
                debug!(runtime = %runtime, "no instance for runtime, falling back to label");
                label.map(|id| (id, runtime))
            }
            Ok(Err(e)) => {
                warn!(runtime = %runtime, error = %e, "while resolving subaccount from instances");
                label.map(|id| (id, runtime))
            }
            Err(e) => {
                error!(runtime = %runtime, error = %e, "subaccount lookup task failed");
                label.map(|id| (id, runtime))
            }
        }
    }

    pub async fn handle(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::Added(obj) => {
                metrics::informer_event("add");
                let Some((subaccount, runtime)) = self.resolve(&obj).await else {
                    warn!(resource = %obj.name, "added resource without subaccount or runtime id");
                    return;
                };
                debug!(subaccount = %subaccount, runtime = %runtime, "resource added");
                self.reconciler.reconcile_resource_update(&subaccount, &runtime, RuntimeState::new(obj.beta_enabled()));
                match self.reconciler.accounts().get_subaccount_data(&subaccount).await {
                    Ok(cis) if !cis.is_empty() => self.reconciler.reconcile_cis_account(&subaccount, cis),
                    Ok(_) => debug!(subaccount = %subaccount, "subaccount not found in CIS"),
                    Err(e) => error!(subaccount = %subaccount, error = %e, "while getting data for subaccount"),
                }
            }
            ResourceEvent::Updated { old, new } => {
                metrics::informer_event("update");
                if old.labels == new.labels {
                    return;
                }
                let Some((subaccount, runtime)) = self.resolve(&new).await else {
                    warn!(resource = %new.name, "updated resource without subaccount or runtime id");
                    return;
                };
                debug!(subaccount = %subaccount, runtime = %runtime, beta_enabled = new.beta_enabled(), "resource labels changed");
                self.reconciler.reconcile_resource_update(&subaccount, &runtime, RuntimeState::new(new.beta_enabled()));
            }
            ResourceEvent::Deleted(obj) => {
                metrics::informer_event("delete");
                let Some((subaccount, runtime)) = self.resolve(&obj).await else {
                    debug!(resource = %obj.name, "deleted resource without subaccount or runtime id");
                    return;
                };
                debug!(subaccount = %subaccount, runtime = %runtime, "resource deleted");
                self.reconciler.delete_runtime_from_state(&subaccount, &runtime);
            }
        }
    }

    /// Consume events until the channel closes or `cancel` fires.
    pub async fn run(self, mut rx: mpsc::Receiver<ResourceEvent>, cancel: CancellationToken) {
        let span = info_span!("informer_handler", component = "informer");
        async move {
            info!("informer handler started");
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = rx.recv() => ev,
                };
                let Some(ev) = next else { break };
                self.handle(ev).await;
            }
            info!("informer handler stopped");
        }
        .instrument(span)
        .await
    }
}
