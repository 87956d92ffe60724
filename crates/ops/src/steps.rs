//! Workflow steps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use subsync_core::{error::is_temporary, Operation, OperationState, OperationType, OPERATION_TIMEOUT_MSG};
use subsync_persist::{Instances, Operations};
use tracing::{debug, info, warn};

use crate::driver::{ClusterDriver, DriverState};
use crate::manager::OperationManager;
use crate::step::{Step, StepOutcome};

/// Retry and polling intervals shared by the steps.
#[derive(Debug, Clone, Copy)]
pub struct StepTimes {
    pub retry: Duration,
    pub status_check: Duration,
    /// Longest time a driver operation may run without the operation being updated.
    pub check_status_timeout: Duration,
    /// Budget for temporary errors while starting a driver operation.
    pub temporary_error_budget: Duration,
}

impl Default for StepTimes {
    fn default() -> Self {
        Self {
            retry: Duration::from_secs(5),
            status_check: Duration::from_secs(60),
            check_status_timeout: Duration::from_secs(3 * 3600),
            temporary_error_budget: Duration::from_secs(5 * 60),
        }
    }
}

/// Moves a pending operation to in progress once no conflicting operation runs on the instance.
pub struct InitialisationStep {
    operations: Arc<dyn Operations>,
    manager: OperationManager,
    times: StepTimes,
}

impl InitialisationStep {
    pub fn new(operations: Arc<dyn Operations>, times: StepTimes) -> Self {
        Self { manager: OperationManager::new(operations.clone()), operations, times }
    }
}

#[async_trait]
impl Step for InitialisationStep {
    fn name(&self) -> &str { "Initialisation" }

    async fn run(&self, operation: Operation) -> StepOutcome {
        let last = match self.operations.get_last_operation(&operation.instance_id) {
            Ok(op) if op.id != operation.id => Some(op),
            Ok(_) => None,
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(operation = %operation.id, error = %e, "while getting last operation of the instance");
                return StepOutcome::retry(operation, self.times.retry);
            }
        };

        if let Some(last) = &last {
            if operation.kind == OperationType::UpgradeCluster && last.kind == OperationType::Deprovision {
                let msg = format!("operation preempted by deprovisioning {}", last.id);
                return self.manager.operation_succeeded(operation, &msg);
            }
        }

        if operation.state != OperationState::Pending {
            return StepOutcome::next(operation);
        }
        if let Some(last) = &last {
            let conflicting = matches!(last.kind, OperationType::Provision | OperationType::UpgradeCluster);
            if conflicting && !last.is_finished() {
                debug!(operation = %operation.id, blocking = %last.id, "waiting for the previous operation to finish");
                return StepOutcome::retry(operation, self.times.status_check);
            }
        }
        self.manager.update_operation(operation, |o| o.state = OperationState::InProgress)
    }
}

/// Starts the driver operation once, then polls it until it ends.
pub struct DriverStep {
    driver: Arc<dyn ClusterDriver>,
    manager: OperationManager,
    times: StepTimes,
}

impl DriverStep {
    pub fn new(driver: Arc<dyn ClusterDriver>, operations: Arc<dyn Operations>, times: StepTimes) -> Self {
        Self { driver, manager: OperationManager::new(operations), times }
    }

    async fn start(&self, operation: Operation) -> StepOutcome {
        match self.driver.start(&operation).await {
            Ok(id) => {
                info!(operation = %operation.id, driver_operation = %id, "driver operation started");
                self.manager.update_operation(operation, |o| o.driver_operation_id = id.clone())
            }
            Err(e) if is_temporary(&e) => self.manager.retry_operation(
                operation,
                "cannot start driver operation at the moment",
                e,
                self.times.retry,
                self.times.temporary_error_budget,
            ),
            Err(e) => self.manager.operation_failed(operation, "cannot start driver operation", Some(e)),
        }
    }
}

#[async_trait]
impl Step for DriverStep {
    fn name(&self) -> &str { "Cluster_Driver" }

    async fn run(&self, mut operation: Operation) -> StepOutcome {
        if operation.driver_operation_id.is_empty() {
            let out = self.start(operation).await;
            if out.error.is_some() || out.needs_retry() || out.operation.is_finished() {
                return out;
            }
            operation = out.operation;
        }

        let since_update = (Utc::now() - operation.updated_at).to_std().unwrap_or_default();
        if since_update > self.times.check_status_timeout {
            let msg = format!("{OPERATION_TIMEOUT_MSG}: {:?}", self.times.check_status_timeout);
            return self.manager.operation_failed(operation, &msg, None);
        }

        let status = match self.driver.operation_status(&operation.driver_operation_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(operation = %operation.id, error = %format!("{e:#}"), "while checking driver operation status");
                return StepOutcome::retry(operation, self.times.status_check);
            }
        };
        debug!(operation = %operation.id, state = ?status.state, "driver operation status");
        match status.state {
            DriverState::Pending | DriverState::InProgress => StepOutcome::retry(operation, self.times.status_check),
            DriverState::Succeeded => StepOutcome::next(operation),
            DriverState::Failed => {
                let msg = format!("driver returned failed status: {}", status.message.unwrap_or_default());
                self.manager.operation_failed(operation, &msg, None)
            }
        }
    }
}

/// Removes the instance row at the end of a deprovisioning.
pub struct RemoveInstanceStep {
    instances: Arc<dyn Instances>,
    manager: OperationManager,
    times: StepTimes,
}

impl RemoveInstanceStep {
    pub fn new(instances: Arc<dyn Instances>, operations: Arc<dyn Operations>, times: StepTimes) -> Self {
        Self { instances, manager: OperationManager::new(operations), times }
    }
}

#[async_trait]
impl Step for RemoveInstanceStep {
    fn name(&self) -> &str { "Remove_Instance" }

    async fn run(&self, operation: Operation) -> StepOutcome {
        match self.instances.delete_instance(&operation.instance_id) {
            Ok(()) => {
                info!(instance = %operation.instance_id, "instance removed");
                StepOutcome::next(operation)
            }
            Err(e) if e.is_not_found() => {
                debug!(instance = %operation.instance_id, "instance already removed");
                StepOutcome::next(operation)
            }
            Err(e) => self.manager.retry_operation(
                operation,
                "cannot remove instance",
                e.into(),
                self.times.retry,
                self.times.temporary_error_budget,
            ),
        }
    }
}
