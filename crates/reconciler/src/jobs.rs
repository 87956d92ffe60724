use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::state::StateReconciler;

#[derive(Debug, Clone, Copy)]
pub struct JobIntervals {
    pub events: Duration,
    pub accounts: Duration,
    pub storage: Duration,
}

/// Run `tick` now and then every `every` until cancelled.
async fn every<F, Fut>(name: &'static str, every: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut timer = tokio::time::interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(job = name, interval = ?every, "job scheduled");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => tick().await,
        }
    }
    info!(job = name, "job stopped");
}

/// Start the events, accounts and storage jobs.
pub fn spawn_jobs(reconciler: Arc<StateReconciler>, intervals: JobIntervals, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let span = || info_span!("jobs", component = "state-reconciler");

    let r = reconciler.clone();
    let events = tokio::spawn(
        every("events", intervals.events, cancel.clone(), move || {
            let r = r.clone();
            async move {
                r.run_events_sync().await;
            }
        })
        .instrument(span()),
    );

    let r = reconciler.clone();
    let accounts = tokio::spawn(
        every("accounts", intervals.accounts, cancel.clone(), move || {
            let r = r.clone();
            async move {
                r.periodic_accounts_sync().await;
            }
        })
        .instrument(span()),
    );

    let r = reconciler;
    let storage = tokio::spawn(
        every("storage", intervals.storage, cancel, move || {
            let r = r.clone();
            async move {
                // storage calls block
                if let Err(e) = tokio::task::spawn_blocking(move || r.store_state_in_db()).await {
                    error!(error = %e, "storage sync task failed");
                }
            }
        })
        .instrument(span()),
    );

    vec![events, accounts, storage]
}
