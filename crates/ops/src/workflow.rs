//! Stage layouts of the four operation kinds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use subsync_persist::Storage;

use crate::driver::ClusterDriver;
use crate::events::Publisher;
use crate::staged::{StagedManager, StagedManagerConfig};
use crate::steps::{DriverStep, InitialisationStep, RemoveInstanceStep, StepTimes};

pub const START_STAGE: &str = "start";
pub const RUNTIME_STAGE: &str = "runtime";
pub const FINISH_STAGE: &str = "finish";

/// Shared dependencies of every workflow.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub storage: Storage,
    pub publisher: Arc<dyn Publisher>,
    pub driver: Arc<dyn ClusterDriver>,
    pub config: StagedManagerConfig,
    pub times: StepTimes,
}

fn base(deps: &WorkflowDeps, timeout: Duration, stages: &[&str]) -> Result<StagedManager> {
    let ops = deps.storage.operations.clone();
    let mut m = StagedManager::new(ops.clone(), deps.publisher.clone(), timeout, deps.config);
    m.define_stages(stages);
    m.add_step(START_STAGE, Arc::new(InitialisationStep::new(ops.clone(), deps.times)), None)?;
    m.add_step(RUNTIME_STAGE, Arc::new(DriverStep::new(deps.driver.clone(), ops, deps.times)), None)?;
    Ok(m)
}

pub fn provisioning(deps: &WorkflowDeps, timeout: Duration) -> Result<StagedManager> {
    base(deps, timeout, &[START_STAGE, RUNTIME_STAGE])
}

pub fn update(deps: &WorkflowDeps, timeout: Duration) -> Result<StagedManager> {
    base(deps, timeout, &[START_STAGE, RUNTIME_STAGE])
}

pub fn upgrade_cluster(deps: &WorkflowDeps, timeout: Duration) -> Result<StagedManager> {
    base(deps, timeout, &[START_STAGE, RUNTIME_STAGE])
}

pub fn deprovisioning(deps: &WorkflowDeps, timeout: Duration) -> Result<StagedManager> {
    let mut m = base(deps, timeout, &[START_STAGE, RUNTIME_STAGE, FINISH_STAGE])?;
    let step = RemoveInstanceStep::new(deps.storage.instances.clone(), deps.storage.operations.clone(), deps.times);
    m.add_step(FINISH_STAGE, Arc::new(step), None)?;
    Ok(m)
}
