//! Multi-stage operation executor with stage checkpoints and panic isolation.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use subsync_core::{
    Dependency, DeprovisioningOperation, LastError, Operation, OperationState, OperationType, SyncError,
    OPERATION_TIMEOUT_MSG,
};
use subsync_persist::Operations;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::events::{OperationEvent, Publisher, StepProcessed};
use crate::manager::OperationManager;
use crate::queue::Executor;
use crate::step::{Step, StepCondition, StepOutcome};

/// Delay returned when the operation cannot be loaded.
pub const LOAD_RETRY: Duration = Duration::from_secs(3);
/// Delay returned when a checkpoint or final state cannot be saved.
pub const SAVE_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct StagedManagerConfig {
    /// Longest time a worker keeps retrying one step before handing the operation back to the queue.
    pub max_step_processing_time: Duration,
    pub workers_amount: usize,
}

impl Default for StagedManagerConfig {
    fn default() -> Self { Self { max_step_processing_time: Duration::from_secs(120), workers_amount: 20 } }
}

thread_local! {
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that keeps the stack of the panicking thread, so the
/// trace points at the step rather than at the recovery site.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            PANIC_STACK.with(|s| *s.borrow_mut() = Some(stack));
            prev(info);
        }));
    });
}

fn take_panic_stack() -> Option<String> { PANIC_STACK.with(|s| s.borrow_mut().take()) }

struct StepEntry {
    step: Arc<dyn Step>,
    condition: Option<StepCondition>,
}

struct Stage {
    name: String,
    steps: Vec<StepEntry>,
}

pub struct StagedManager {
    storage: Arc<dyn Operations>,
    publisher: Arc<dyn Publisher>,
    operations: OperationManager,
    stages: Vec<Stage>,
    operation_timeout: Duration,
    config: StagedManagerConfig,
    speed_factor: u32,
}

impl StagedManager {
    pub fn new(
        storage: Arc<dyn Operations>,
        publisher: Arc<dyn Publisher>,
        operation_timeout: Duration,
        config: StagedManagerConfig,
    ) -> Self {
        install_panic_hook();
        Self {
            operations: OperationManager::new(storage.clone()),
            storage,
            publisher,
            stages: Vec::new(),
            operation_timeout,
            config,
            speed_factor: 1,
        }
    }

    /// Divide step sleeps by `factor`. Tests only.
    pub fn speed_up(&mut self, factor: u32) { self.speed_factor = factor.max(1); }

    pub fn define_stages(&mut self, names: &[&str]) {
        self.stages = names.iter().map(|n| Stage { name: n.to_string(), steps: Vec::new() }).collect();
    }

    pub fn add_step(&mut self, stage: &str, step: Arc<dyn Step>, condition: Option<StepCondition>) -> Result<()> {
        let s = self
            .stages
            .iter_mut()
            .find(|s| s.name == stage)
            .ok_or_else(|| anyhow!("stage {stage} not defined"))?;
        s.steps.push(StepEntry { step, condition });
        Ok(())
    }

    pub fn stages(&self) -> Vec<String> { self.stages.iter().map(|s| s.name.clone()).collect() }

    pub fn config(&self) -> StagedManagerConfig { self.config }

    /// Process one operation. Returns a delay after which it should be executed again,
    /// or zero when it needs no more work.
    pub async fn execute(&self, operation_id: &str) -> Result<Duration> {
        let operation = match self.storage.get_operation_by_id(operation_id) {
            Ok(op) => op,
            Err(e) => {
                error!(operation = %operation_id, error = %e, "cannot fetch operation from storage");
                return Ok(LOAD_RETRY);
            }
        };
        let span = info_span!("operation", component = "staged-manager", operation = %operation.id, instance = %operation.instance_id, plan = %operation.plan_id());
        self.execute_loaded(operation).instrument(span).await
    }

    async fn execute_loaded(&self, mut operation: Operation) -> Result<Duration> {
        info!(global_account = %operation.provisioning_parameters.global_account_id, "start processing operation steps");
        let age = (Utc::now() - operation.created_at).to_std().unwrap_or_default();
        if age > self.operation_timeout {
            return self.fail_on_timeout(operation);
        }

        for stage in &self.stages {
            if operation.is_stage_finished(&stage.name) {
                continue;
            }
            for entry in &stage.steps {
                let name = entry.step.name().to_string();
                if entry.condition.as_ref().is_some_and(|c| !c(&operation)) {
                    debug!(stage = %stage.name, step = %name, "skipping");
                    continue;
                }
                let out = self.run_step(entry.step.as_ref(), operation).await;
                operation = out.operation;
                if let Some(err) = out.error {
                    error!(stage = %stage.name, step = %name, error = %format!("{err:#}"), "process operation failed");
                    if operation.state == OperationState::Failed {
                        self.publish_finished(&operation);
                    }
                    return Err(err);
                }
                if matches!(operation.state, OperationState::Failed | OperationState::Succeeded) {
                    info!(step = %name, state = %operation.state, "operation got final state, process finished");
                    self.publish_finished(&operation);
                    self.publish_deprovisioning_succeeded(&operation);
                    return Ok(Duration::ZERO);
                }
                if !out.backoff.is_zero() {
                    warn!(step = %name, after = ?out.backoff, "retrying step by restarting the operation");
                    return Ok(out.backoff);
                }
            }
            operation.finish_stage(&stage.name);
            match self.storage.update_operation(operation.clone()) {
                Ok(saved) => {
                    info!(stage = %stage.name, "finished stage");
                    operation = saved;
                }
                // the operation may already be gone at the end of a deprovisioning
                Err(e) if e.is_not_found() => debug!(stage = %stage.name, "operation not found while saving stage"),
                Err(e) => {
                    warn!(stage = %stage.name, error = %e, "unable to save operation with finished stage");
                    return Ok(SAVE_RETRY);
                }
            }
        }

        operation.state = OperationState::Succeeded;
        operation.description = "Processing finished".into();
        match self.storage.update_operation(operation.clone()) {
            Ok(saved) => operation = saved,
            // a finished deprovisioning may already have removed the record
            Err(e) if e.is_not_found() => debug!("operation not found while saving final state"),
            Err(e) => {
                warn!(error = %e, "unable to save succeeded operation");
                return Ok(SAVE_RETRY);
            }
        }
        info!("operation succeeded");
        self.publisher.publish(OperationEvent::Succeeded(operation.clone()));
        self.publish_finished(&operation);
        self.publish_deprovisioning_succeeded(&operation);
        Ok(Duration::ZERO)
    }

    fn fail_on_timeout(&self, mut operation: Operation) -> Result<Duration> {
        info!(created_at = %operation.created_at, "operation has reached the time limit");
        operation.last_error = LastError::timeout();
        operation.state = OperationState::Failed;
        match self.storage.update_operation(operation.clone()) {
            Ok(saved) => operation = saved,
            Err(e) if e.is_not_found() => debug!("operation not found while saving timeout"),
            Err(e) => {
                warn!(error = %e, "unable to save timed out operation");
                return Ok(SAVE_RETRY);
            }
        }
        let timeout = SyncError::timeout(Dependency::Unknown, OPERATION_TIMEOUT_MSG);
        self.publish_finished(&operation);
        self.publisher.publish(OperationEvent::StepProcessed {
            step: StepProcessed {
                step_name: String::new(),
                duration: (Utc::now() - operation.created_at).to_std().unwrap_or_default(),
                when: Duration::ZERO,
                error: Some(timeout.to_string()),
            },
            old: operation.clone(),
            new: operation,
        });
        Err(timeout.into())
    }

    /// Run one step, retrying in place while it asks for a backoff and the
    /// processing budget is not spent.
    async fn run_step(&self, step: &dyn Step, operation: Operation) -> StepOutcome {
        let name = step.name().to_string();
        let begin = Instant::now();
        let mut current = operation;
        loop {
            let start = Instant::now();
            debug!(step = %name, "start step");
            let old = current.clone();
            let (mut out, stack) = match AssertUnwindSafe(step.run(current.clone())).catch_unwind().await {
                Ok(out) => (out, None),
                Err(panic) => {
                    let (out, stack) = self.recover_panic(&name, old.clone(), panic);
                    (out, Some(stack))
                }
            };
            if let Some(err) = &out.error {
                let mut last = LastError::from_error(err, &name);
                if let Some(stack) = stack {
                    last.message = format!("{}\n{stack}", last.message);
                }
                out.operation.last_error = last;
                warn!(
                    step = %name,
                    error_component = %out.operation.last_error.dependency,
                    error_reason = %out.operation.last_error.reason,
                    "last error from step"
                );
                match self.storage.update_operation(out.operation.clone()) {
                    Ok(saved) => out.operation = saved,
                    Err(e) => error!(step = %name, error = %e, "unable to save operation with last error from step"),
                }
            }
            self.publisher.publish(OperationEvent::StepProcessed {
                step: StepProcessed {
                    step_name: name.clone(),
                    duration: start.elapsed(),
                    when: out.backoff,
                    error: out.error.as_ref().map(|e| format!("{e:#}")),
                },
                old,
                new: out.operation.clone(),
            });
            if out.backoff.is_zero() || out.error.is_some() || begin.elapsed() > self.config.max_step_processing_time {
                return out;
            }
            debug!(step = %name, sleep = ?out.backoff, "step sleeping");
            tokio::time::sleep(out.backoff / self.speed_factor).await;
            current = out.operation;
        }
    }

    fn recover_panic(&self, step: &str, operation: Operation, panic: Box<dyn std::any::Any + Send>) -> (StepOutcome, String) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        // another hook may have replaced ours
        let stack = take_panic_stack().unwrap_or_else(|| Backtrace::force_capture().to_string());
        error!(step, panic = %msg, stack = %stack, "panic in step");
        let cause = SyncError::panic_recovered(Dependency::step(step), format!("recovered from panic: {msg}"));
        (self.operations.operation_failed(operation, "recovered from panic", Some(cause.into())), stack)
    }

    fn publish_finished(&self, operation: &Operation) {
        self.publisher.publish(OperationEvent::Finished { operation: operation.clone(), plan_id: operation.plan_id().to_string() });
    }

    fn publish_deprovisioning_succeeded(&self, operation: &Operation) {
        if operation.state == OperationState::Succeeded && operation.kind == OperationType::Deprovision {
            self.publisher.publish(OperationEvent::DeprovisioningSucceeded(DeprovisioningOperation(operation.clone())));
        }
    }
}

#[async_trait]
impl Executor for StagedManager {
    async fn execute(&self, id: &str) -> Result<Duration> { StagedManager::execute(self, id).await }
}
