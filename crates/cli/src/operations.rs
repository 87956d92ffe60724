//! `operations` subcommand: one work queue per operation kind, fed with the
//! unfinished operations found in the store.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use subsync_core::OperationType;
use subsync_ops::metrics::{register_collector, OperationStats};
use subsync_ops::workflow::{self, WorkflowDeps};
use subsync_ops::{HttpClusterDriver, PubSub, StagedManager, WorkQueue};
use subsync_persist::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::OperationsArgs;

pub struct Queues {
    provisioning: Arc<WorkQueue>,
    deprovisioning: Arc<WorkQueue>,
    update: Arc<WorkQueue>,
    upgrade_cluster: Arc<WorkQueue>,
}

impl Queues {
    fn all(&self) -> [&Arc<WorkQueue>; 4] { [&self.provisioning, &self.deprovisioning, &self.update, &self.upgrade_cluster] }

    pub fn for_kind(&self, kind: OperationType) -> &Arc<WorkQueue> {
        match kind {
            OperationType::Provision => &self.provisioning,
            OperationType::Deprovision => &self.deprovisioning,
            OperationType::Update => &self.update,
            OperationType::UpgradeCluster => &self.upgrade_cluster,
        }
    }
}

fn queue(name: &str, manager: StagedManager, args: &OperationsArgs) -> Arc<WorkQueue> {
    Arc::new(WorkQueue::new(name, Arc::new(manager), args.worker_health_check_warn_after, args.worker_health_check_interval))
}

pub fn build_queues(args: &OperationsArgs, deps: &WorkflowDeps) -> Result<Queues> {
    Ok(Queues {
        provisioning: queue("provisioning", workflow::provisioning(deps, args.provisioning_timeout)?, args),
        deprovisioning: queue("deprovisioning", workflow::deprovisioning(deps, args.deprovisioning_timeout)?, args),
        update: queue("update", workflow::update(deps, args.provisioning_timeout)?, args),
        upgrade_cluster: queue("upgrade-cluster", workflow::upgrade_cluster(deps, args.provisioning_timeout)?, args),
    })
}

/// Enqueue every unfinished operation created within the lookback window. Returns how many were queued.
pub fn resume_unfinished(storage: &Storage, queues: &Queues, lookback: std::time::Duration) -> Result<usize> {
    let to = Utc::now();
    let from = to - chrono::Duration::from_std(lookback).context("lookback out of range")?;
    let mut queued = 0;
    for op in storage.operations.list_operations_in_time_range(from, to)? {
        if op.is_finished() {
            continue;
        }
        queues.for_kind(op.kind).add(&op.id);
        queued += 1;
    }
    Ok(queued)
}

pub async fn run(args: OperationsArgs, storage: Storage, cancel: CancellationToken) -> Result<()> {
    let bus = Arc::new(PubSub::new());
    register_collector(&bus);
    let driver = Arc::new(HttpClusterDriver::new(&args.cluster_driver_url, args.cluster_driver_timeout).context("cluster driver client")?);
    let deps = WorkflowDeps {
        storage: storage.clone(),
        publisher: bus,
        driver,
        config: args.manager_config(),
        times: args.step_times(),
    };
    let queues = build_queues(&args, &deps)?;
    let resumed = resume_unfinished(&storage, &queues, args.operations_lookback)?;
    info!(resumed, workers = args.workers_amount, "starting operation workers");

    let mut tasks = Vec::new();
    for q in queues.all() {
        tasks.extend(q.run(args.workers_amount, cancel.clone()));
    }
    let stats = OperationStats::new(storage.operations.clone());
    tasks.push(tokio::spawn(stats.run(args.operation_stats_interval, cancel.clone())));

    cancel.cancelled().await;
    for t in futures::future::join_all(tasks).await {
        if let Err(e) = t {
            warn!(error = %e, "operations task ended abnormally");
        }
    }
    info!("operation workers stopped");
    Ok(())
}
