use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use subsync_apply::Updater;
use subsync_cis::{CisEndpointConfig, RateLimitedCisClient};
use subsync_kubehub::{start_informer, KubeResourceApi};
use subsync_persist::Storage;
use subsync_store::{EventWindow, SubaccountPriorityQueue, DEFAULT_QUEUE_SIZE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handler::InformerHandler;
use crate::jobs::{spawn_jobs, JobIntervals};
use crate::metrics;
use crate::state::StateReconciler;

/// Settings of the `sync` command.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub cis_accounts: CisEndpointConfig,
    pub cis_events: CisEndpointConfig,
    pub update_resources: bool,
    pub events_window_size: Duration,
    pub events_window_interval: Duration,
    pub accounts_sync_interval: Duration,
    pub storage_sync_interval: Duration,
    pub sync_queue_sleep_interval: Duration,
    pub always_subaccount_from_database: bool,
    pub resource_namespace: String,
    /// `group/version/Kind` of the runtime resources.
    pub resource_gvk: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cis_accounts: CisEndpointConfig::default(),
            cis_events: CisEndpointConfig::default(),
            update_resources: false,
            events_window_size: Duration::from_secs(20 * 60),
            events_window_interval: Duration::from_secs(15 * 60),
            accounts_sync_interval: Duration::from_secs(24 * 3600),
            storage_sync_interval: Duration::from_secs(10 * 60),
            sync_queue_sleep_interval: Duration::from_secs(30),
            always_subaccount_from_database: false,
            resource_namespace: "kcp-system".into(),
            resource_gvk: "operator.kyma-project.io/v1beta2/Kyma".into(),
        }
    }
}

impl SyncConfig {
    /// Raise the events window to the polling interval so no event falls between polls.
    pub fn validated(mut self) -> Self {
        if self.events_window_size < self.events_window_interval {
            warn!(
                window = ?self.events_window_size,
                interval = ?self.events_window_interval,
                "events window size is smaller than the polling interval, raising it to the interval"
            );
            self.events_window_size = self.events_window_interval;
        }
        self
    }

    fn intervals(&self) -> JobIntervals {
        JobIntervals {
            events: self.events_window_interval,
            accounts: self.accounts_sync_interval,
            storage: self.storage_sync_interval,
        }
    }
}

pub struct SyncService {
    config: SyncConfig,
    storage: Storage,
}

impl SyncService {
    pub fn new(config: SyncConfig, storage: Storage) -> Self { Self { config: config.validated(), storage } }

    pub fn config(&self) -> &SyncConfig { &self.config }

    /// Wire every component and run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let cfg = &self.config;
        info!(
            update_resources = cfg.update_resources,
            events_window_size = ?cfg.events_window_size,
            events_window_interval = ?cfg.events_window_interval,
            accounts_sync_interval = ?cfg.accounts_sync_interval,
            storage_sync_interval = ?cfg.storage_sync_interval,
            always_subaccount_from_database = cfg.always_subaccount_from_database,
            namespace = %cfg.resource_namespace,
            "starting subaccount sync"
        );
        metrics::set_dry_run(!cfg.update_resources);

        let accounts = Arc::new(RateLimitedCisClient::new("accounts", cfg.cis_accounts.clone()).context("cis accounts client")?);
        let events = Arc::new(RateLimitedCisClient::new("events", cfg.cis_events.clone()).context("cis events client")?);
        let queue = Arc::new(SubaccountPriorityQueue::with_hooks(DEFAULT_QUEUE_SIZE, metrics::queue_hooks()));
        let reconciler = Arc::new(StateReconciler::new(
            queue.clone(),
            self.storage.clone(),
            accounts,
            events,
            EventWindow::with_system_clock(cfg.events_window_size),
        ));
        let r = reconciler.clone();
        tokio::task::spawn_blocking(move || r.recreate_state_from_db())
            .await
            .context("state recreation task")?
            .context("recreating state from storage")?;

        let resources = KubeResourceApi::connect(&cfg.resource_gvk, &cfg.resource_namespace)
            .await
            .context("connecting to resource api")?;

        let (tx, rx) = mpsc::channel(256);
        let mut tasks = Vec::new();
        let informer_cancel = cancel.clone();
        let informer_api = resources.api();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = start_informer(informer_api, tx, informer_cancel).await {
                warn!(error = %e, "informer failed");
            }
        }));
        let handler = InformerHandler::new(reconciler.clone(), self.storage.instances.clone(), cfg.always_subaccount_from_database);
        tasks.push(tokio::spawn(handler.run(rx, cancel.clone())));
        tasks.extend(spawn_jobs(reconciler, cfg.intervals(), cancel.clone()));

        if cfg.update_resources {
            let updater = Updater::new(Arc::new(resources), queue, cfg.sync_queue_sleep_interval);
            tasks.push(tokio::spawn(updater.run(cancel.clone())));
        } else {
            info!("resource updates disabled, running in dry-run mode");
        }

        cancel.cancelled().await;
        for t in futures::future::join_all(tasks).await {
            if let Err(e) = t {
                warn!(error = %e, "task ended abnormally");
            }
        }
        info!("subaccount sync stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_raised_to_interval() {
        let cfg = SyncConfig {
            events_window_size: Duration::from_secs(60),
            events_window_interval: Duration::from_secs(300),
            ..Default::default()
        }
        .validated();
        assert_eq!(cfg.events_window_size, Duration::from_secs(300));
    }

    #[test]
    fn larger_window_is_kept() {
        let cfg = SyncConfig::default().validated();
        assert_eq!(cfg.events_window_size, Duration::from_secs(20 * 60));
    }
}
