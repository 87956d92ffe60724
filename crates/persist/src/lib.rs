//! Subsync persistence: subaccount state mirror, instances and operations.
//! SQLite for production, an in-memory twin for tests and dry runs.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use subsync_core::{
    DeprovisioningOperation, Instance, Operation, OperationState, OperationType, ProvisioningOperation,
    RuntimeId, SubaccountId, SubaccountStateRow, SyncError, UpdatingOperation, UpgradeClusterOperation,
};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("operation {id} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict { id: String, expected: i64, actual: i64 },
    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl PersistError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self { Self::NotFound { entity, id: id.into() } }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
}

pub type Result<T> = std::result::Result<T, PersistError>;

/// True when the chain holds a missing-row error, persisted or tagged.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        e.downcast_ref::<PersistError>().is_some_and(PersistError::is_not_found)
            || e.downcast_ref::<SyncError>().is_some_and(SyncError::is_not_found)
    })
}

/// Durable mirror of the CIS-derived part of each subaccount state.
pub trait SubaccountStates: Send + Sync {
    fn list_states(&self) -> Result<Vec<SubaccountStateRow>>;
    fn upsert_state(&self, row: &SubaccountStateRow) -> Result<()>;
    fn delete_state(&self, id: &SubaccountId) -> Result<()>;
}

pub trait Instances: Send + Sync {
    /// Subaccounts owning at least one live instance.
    fn distinct_subaccounts(&self) -> Result<BTreeSet<SubaccountId>>;
    fn get_instance(&self, instance_id: &str) -> Result<Instance>;
    fn insert_instance(&self, instance: &Instance) -> Result<()>;
    fn delete_instance(&self, instance_id: &str) -> Result<()>;
    fn subaccount_for_runtime(&self, runtime_id: &RuntimeId) -> Result<Option<SubaccountId>>;
}

/// Number of operations per (type, state, plan).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OperationCount {
    pub kind: OperationType,
    pub state: OperationState,
    pub plan_id: String,
    pub count: u64,
}

pub trait Operations: Send + Sync {
    fn insert_operation(&self, op: &Operation) -> Result<()>;
    fn get_operation_by_id(&self, id: &str) -> Result<Operation>;
    /// Persist `op` if its version matches the stored one. Returns the stored
    /// record with bumped `version` and `updated_at`.
    fn update_operation(&self, op: Operation) -> Result<Operation>;
    /// Most recent non-pending operation of an instance.
    fn get_last_operation(&self, instance_id: &str) -> Result<Operation>;
    fn list_operations_in_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Operation>>;
    fn count_by_type_state_plan(&self) -> Result<Vec<OperationCount>>;

    fn insert_provisioning_operation(&self, op: &ProvisioningOperation) -> Result<()> { self.insert_operation(op) }
    fn insert_deprovisioning_operation(&self, op: &DeprovisioningOperation) -> Result<()> { self.insert_operation(op) }
    fn insert_updating_operation(&self, op: &UpdatingOperation) -> Result<()> { self.insert_operation(op) }
    fn insert_upgrade_cluster_operation(&self, op: &UpgradeClusterOperation) -> Result<()> { self.insert_operation(op) }
}

/// Handles to every store, usually backed by the same database.
#[derive(Clone)]
pub struct Storage {
    pub states: Arc<dyn SubaccountStates>,
    pub instances: Arc<dyn Instances>,
    pub operations: Arc<dyn Operations>,
}

impl Storage {
    pub fn sqlite(path: &str) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::open(path)?);
        Ok(Self::from_shared(store))
    }

    pub fn memory() -> Self { Self::from_shared(Arc::new(MemoryStore::default())) }

    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: SubaccountStates + Instances + Operations + 'static,
    {
        Self { states: store.clone(), instances: store.clone(), operations: store }
    }
}

pub(crate) fn millis(t: DateTime<Utc>) -> i64 { t.timestamp_millis() }

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> { DateTime::from_timestamp_millis(ms).unwrap_or_default() }
