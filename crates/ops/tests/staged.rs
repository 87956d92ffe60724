#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use subsync_core::{Code, Instance, Operation, OperationState, OperationType, ProvisioningParameters};
use subsync_ops::steps::StepTimes;
use subsync_ops::workflow::{self, WorkflowDeps};
use subsync_ops::{
    ClusterDriver, DriverState, DriverStatus, EventKind, OperationEvent, Publisher, StagedManager, StagedManagerConfig,
    Step, StepCondition, StepOutcome,
};
use subsync_persist::{Instances, MemoryStore, Operations, Storage};

#[derive(Default)]
struct Recorder(Mutex<Vec<OperationEvent>>);

impl Publisher for Recorder {
    fn publish(&self, event: OperationEvent) { self.0.lock().unwrap().push(event); }
}

impl Recorder {
    fn count(&self, kind: EventKind) -> usize { self.0.lock().unwrap().iter().filter(|e| e.kind() == kind).count() }
}

struct Counting {
    name: &'static str,
    runs: AtomicUsize,
}

impl Counting {
    fn new(name: &'static str) -> Arc<Self> { Arc::new(Self { name, runs: AtomicUsize::new(0) }) }
}

#[async_trait]
impl Step for Counting {
    fn name(&self) -> &str { self.name }
    async fn run(&self, op: Operation) -> StepOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        StepOutcome::next(op)
    }
}

/// Fails on the first run, succeeds afterwards.
struct FailOnce {
    runs: AtomicUsize,
}

#[async_trait]
impl Step for FailOnce {
    fn name(&self) -> &str { "fail_once" }
    async fn run(&self, op: Operation) -> StepOutcome {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            return StepOutcome::error(op, anyhow!("driver unavailable"));
        }
        StepOutcome::next(op)
    }
}

/// Asks for a retry `n` times before finishing.
struct RetryN {
    left: AtomicUsize,
}

#[async_trait]
impl Step for RetryN {
    fn name(&self) -> &str { "retry_n" }
    async fn run(&self, op: Operation) -> StepOutcome {
        if self.left.load(Ordering::SeqCst) > 0 {
            self.left.fetch_sub(1, Ordering::SeqCst);
            return StepOutcome::retry(op, Duration::from_secs(5));
        }
        StepOutcome::next(op)
    }
}

struct Panics;

#[async_trait]
impl Step for Panics {
    fn name(&self) -> &str { "panics" }
    async fn run(&self, _op: Operation) -> StepOutcome { panic!("index out of range") }
}

fn setup(timeout: Duration) -> (Arc<MemoryStore>, Arc<Recorder>, StagedManager) {
    let store = Arc::new(MemoryStore::default());
    let bus = Arc::new(Recorder::default());
    let mut m = StagedManager::new(store.clone(), bus.clone(), timeout, StagedManagerConfig::default());
    m.speed_up(1000);
    (store, bus, m)
}

fn insert(store: &MemoryStore, kind: OperationType, instance: &str) -> Operation {
    let params = ProvisioningParameters { plan_id: "azure".into(), ..Default::default() };
    let op = Operation::new(kind, instance, params);
    store.insert_operation(&op).unwrap();
    op
}

#[tokio::test]
async fn timed_out_operation_fails_once() {
    let (store, bus, mut m) = setup(Duration::from_secs(6 * 3600));
    let step = Counting::new("never");
    m.define_stages(&["start"]);
    m.add_step("start", step.clone(), None).unwrap();
    let mut op = Operation::new(OperationType::Provision, "i1", ProvisioningParameters::default());
    op.created_at = Utc::now() - chrono::Duration::hours(7);
    store.insert_operation(&op).unwrap();

    let err = m.execute(&op.id).await.unwrap_err();
    assert!(err.to_string().contains("time limit"));
    let saved = store.get_operation_by_id(&op.id).unwrap();
    assert_eq!(saved.state, OperationState::Failed);
    assert!(saved.last_error.reason.contains("time limit"));
    assert_eq!(saved.last_error.code, Code::Timeout);
    assert_eq!(bus.count(EventKind::Finished), 1);
    assert_eq!(step.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn finished_stage_is_recorded_once_and_skipped() {
    let (store, bus, mut m) = setup(Duration::from_secs(3600));
    let first = Counting::new("first");
    m.define_stages(&["a", "b"]);
    m.add_step("a", first.clone(), None).unwrap();
    m.add_step("b", Arc::new(FailOnce { runs: AtomicUsize::new(0) }), None).unwrap();
    let op = insert(&store, OperationType::Provision, "i1");

    assert!(m.execute(&op.id).await.is_err());
    let saved = store.get_operation_by_id(&op.id).unwrap();
    assert_eq!(saved.finished_stages, vec!["a".to_string()]);
    assert_eq!(saved.last_error.dependency.to_string(), "step:fail_once");
    assert_eq!(saved.state, OperationState::Pending);

    assert_eq!(m.execute(&op.id).await.unwrap(), Duration::ZERO);
    assert_eq!(first.runs.load(Ordering::SeqCst), 1);
    let saved = store.get_operation_by_id(&op.id).unwrap();
    assert_eq!(saved.finished_stages, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(saved.state, OperationState::Succeeded);
    assert_eq!(bus.count(EventKind::Succeeded), 1);
    assert_eq!(bus.count(EventKind::Finished), 1);
}

#[tokio::test]
async fn conditional_step_is_skipped() {
    let (store, _bus, mut m) = setup(Duration::from_secs(3600));
    let only_deprovision = Counting::new("cleanup");
    m.define_stages(&["a"]);
    let cond: StepCondition = Arc::new(|op: &Operation| op.kind == OperationType::Deprovision);
    m.add_step("a", only_deprovision.clone(), Some(cond)).unwrap();
    let op = insert(&store, OperationType::Provision, "i1");
    m.execute(&op.id).await.unwrap();
    assert_eq!(only_deprovision.runs.load(Ordering::SeqCst), 0);
    assert!(m.add_step("missing", only_deprovision, None).is_err());
}

#[tokio::test]
async fn step_retries_in_place_within_budget() {
    let (store, bus, mut m) = setup(Duration::from_secs(3600));
    m.define_stages(&["a"]);
    m.add_step("a", Arc::new(RetryN { left: AtomicUsize::new(2) }), None).unwrap();
    let op = insert(&store, OperationType::Provision, "i1");
    assert_eq!(m.execute(&op.id).await.unwrap(), Duration::ZERO);
    assert_eq!(bus.count(EventKind::StepProcessed), 3);
    assert_eq!(store.get_operation_by_id(&op.id).unwrap().state, OperationState::Succeeded);
}

#[tokio::test]
async fn exhausted_budget_hands_backoff_to_the_queue() {
    let store = Arc::new(MemoryStore::default());
    let bus = Arc::new(Recorder::default());
    let cfg = StagedManagerConfig { max_step_processing_time: Duration::ZERO, workers_amount: 1 };
    let mut m = StagedManager::new(store.clone(), bus, Duration::from_secs(3600), cfg);
    m.define_stages(&["a"]);
    m.add_step("a", Arc::new(RetryN { left: AtomicUsize::new(1) }), None).unwrap();
    let op = insert(&store, OperationType::Provision, "i1");
    assert_eq!(m.execute(&op.id).await.unwrap(), Duration::from_secs(5));
    assert!(store.get_operation_by_id(&op.id).unwrap().finished_stages.is_empty());
}

#[tokio::test]
async fn panicking_step_fails_the_operation() {
    let (store, bus, mut m) = setup(Duration::from_secs(3600));
    m.define_stages(&["a"]);
    m.add_step("a", Arc::new(Panics), None).unwrap();
    let op = insert(&store, OperationType::Provision, "i1");
    assert!(m.execute(&op.id).await.is_err());
    let saved = store.get_operation_by_id(&op.id).unwrap();
    assert_eq!(saved.state, OperationState::Failed);
    assert!(saved.last_error.reason.contains("recovered from panic"));
    assert_eq!(saved.last_error.code, Code::PanicRecovered);
    assert_eq!(bus.count(EventKind::Finished), 1);
}

#[tokio::test]
async fn unknown_operation_is_retried_shortly() {
    let (_store, _bus, m) = setup(Duration::from_secs(3600));
    assert_eq!(m.execute("missing").await.unwrap(), subsync_ops::LOAD_RETRY);
}

#[derive(Default)]
struct FakeDriver {
    started: Mutex<Vec<String>>,
    states: Mutex<Vec<DriverState>>,
}

#[async_trait]
impl ClusterDriver for FakeDriver {
    async fn start(&self, operation: &Operation) -> Result<String> {
        self.started.lock().unwrap().push(operation.id.clone());
        Ok(format!("drv-{}", operation.id))
    }

    async fn operation_status(&self, _id: &str) -> Result<DriverStatus> {
        let mut s = self.states.lock().unwrap();
        let state = if s.len() > 1 { s.remove(0) } else { s.first().copied().unwrap_or(DriverState::Succeeded) };
        Ok(DriverStatus { state, message: Some("done".into()) })
    }
}

fn deps(store: &Arc<MemoryStore>, bus: Arc<Recorder>, driver: Arc<FakeDriver>) -> WorkflowDeps {
    let times = StepTimes { retry: Duration::from_millis(1), status_check: Duration::from_millis(1), ..Default::default() };
    WorkflowDeps { storage: Storage::from_shared(store.clone()), publisher: bus, driver, config: StagedManagerConfig::default(), times }
}

#[tokio::test]
async fn deprovisioning_removes_the_instance() {
    let store = Arc::new(MemoryStore::default());
    let bus = Arc::new(Recorder::default());
    let driver = Arc::new(FakeDriver::default());
    driver.states.lock().unwrap().extend([DriverState::InProgress, DriverState::Succeeded]);
    store.insert_instance(&Instance::new("i1", "sa1", "azure")).unwrap();
    let m = workflow::deprovisioning(&deps(&store, bus.clone(), driver.clone()), Duration::from_secs(3600)).unwrap();
    assert_eq!(m.stages(), vec!["start", "runtime", "finish"]);

    let op = insert(&store, OperationType::Deprovision, "i1");
    assert_eq!(m.execute(&op.id).await.unwrap(), Duration::ZERO);
    let saved = store.get_operation_by_id(&op.id).unwrap();
    assert_eq!(saved.state, OperationState::Succeeded);
    assert_eq!(saved.driver_operation_id, format!("drv-{}", op.id));
    assert!(store.get_instance("i1").is_err());
    assert_eq!(driver.started.lock().unwrap().len(), 1);
    assert_eq!(bus.count(EventKind::DeprovisioningSucceeded), 1);
}

#[tokio::test]
async fn failed_driver_fails_the_operation() {
    let store = Arc::new(MemoryStore::default());
    let bus = Arc::new(Recorder::default());
    let driver = Arc::new(FakeDriver::default());
    driver.states.lock().unwrap().push(DriverState::Failed);
    let m = workflow::provisioning(&deps(&store, bus.clone(), driver), Duration::from_secs(3600)).unwrap();
    let op = insert(&store, OperationType::Provision, "i1");
    assert!(m.execute(&op.id).await.is_err());
    let saved = store.get_operation_by_id(&op.id).unwrap();
    assert_eq!(saved.state, OperationState::Failed);
    assert!(saved.description.contains("failed status"));
    assert_eq!(bus.count(EventKind::Finished), 1);
}

#[tokio::test]
async fn upgrade_is_preempted_by_deprovisioning() {
    let store = Arc::new(MemoryStore::default());
    let bus = Arc::new(Recorder::default());
    let driver = Arc::new(FakeDriver::default());
    let m = workflow::upgrade_cluster(&deps(&store, bus.clone(), driver.clone()), Duration::from_secs(3600)).unwrap();

    let mut deprovision = insert(&store, OperationType::Deprovision, "i1");
    deprovision.state = OperationState::InProgress;
    store.update_operation(deprovision).unwrap();
    let upgrade = insert(&store, OperationType::UpgradeCluster, "i1");

    assert_eq!(m.execute(&upgrade.id).await.unwrap(), Duration::ZERO);
    let saved = store.get_operation_by_id(&upgrade.id).unwrap();
    assert_eq!(saved.state, OperationState::Succeeded);
    assert!(saved.description.contains("preempted by deprovisioning"));
    assert!(driver.started.lock().unwrap().is_empty());
    assert_eq!(bus.count(EventKind::Finished), 1);
}
