use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use subsync_core::{Instance, Operation, OperationState, RuntimeId, SubaccountId, SubaccountStateRow};

use crate::{Instances, OperationCount, Operations, PersistError, Result, SubaccountStates};

#[derive(Default)]
struct Tables {
    states: BTreeMap<SubaccountId, SubaccountStateRow>,
    instances: BTreeMap<String, Instance>,
    operations: BTreeMap<String, Operation>,
}

/// In-memory store with the same contract as [`crate::SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, Tables> { self.tables.lock().unwrap_or_else(|e| e.into_inner()) }
}

impl SubaccountStates for MemoryStore {
    fn list_states(&self) -> Result<Vec<SubaccountStateRow>> { Ok(self.lock().states.values().cloned().collect()) }

    fn upsert_state(&self, row: &SubaccountStateRow) -> Result<()> {
        self.lock().states.insert(row.id.clone(), row.clone());
        Ok(())
    }

    fn delete_state(&self, id: &SubaccountId) -> Result<()> {
        self.lock().states.remove(id);
        Ok(())
    }
}

impl Instances for MemoryStore {
    fn distinct_subaccounts(&self) -> Result<BTreeSet<SubaccountId>> {
        Ok(self
            .lock()
            .instances
            .values()
            .filter(|i| i.deleted_at.is_none())
            .map(|i| i.subaccount_id.clone())
            .collect())
    }

    fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        self.lock().instances.get(instance_id).cloned().ok_or_else(|| PersistError::not_found("instance", instance_id))
    }

    fn insert_instance(&self, instance: &Instance) -> Result<()> {
        let mut t = self.lock();
        if t.instances.contains_key(&instance.instance_id) {
            return Err(PersistError::AlreadyExists { entity: "instance", id: instance.instance_id.clone() });
        }
        t.instances.insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    fn delete_instance(&self, instance_id: &str) -> Result<()> {
        match self.lock().instances.remove(instance_id) {
            Some(_) => Ok(()),
            None => Err(PersistError::not_found("instance", instance_id)),
        }
    }

    fn subaccount_for_runtime(&self, runtime_id: &RuntimeId) -> Result<Option<SubaccountId>> {
        Ok(self
            .lock()
            .instances
            .values()
            .find(|i| i.deleted_at.is_none() && i.runtime_id.as_ref() == Some(runtime_id))
            .map(|i| i.subaccount_id.clone()))
    }
}

impl Operations for MemoryStore {
    fn insert_operation(&self, op: &Operation) -> Result<()> {
        let mut t = self.lock();
        if t.operations.contains_key(&op.id) {
            return Err(PersistError::AlreadyExists { entity: "operation", id: op.id.clone() });
        }
        t.operations.insert(op.id.clone(), op.clone());
        Ok(())
    }

    fn get_operation_by_id(&self, id: &str) -> Result<Operation> {
        self.lock().operations.get(id).cloned().ok_or_else(|| PersistError::not_found("operation", id))
    }

    fn update_operation(&self, mut op: Operation) -> Result<Operation> {
        let mut t = self.lock();
        let stored = t.operations.get_mut(&op.id).ok_or_else(|| PersistError::not_found("operation", op.id.clone()))?;
        if stored.version != op.version {
            return Err(PersistError::Conflict { id: op.id.clone(), expected: op.version, actual: stored.version });
        }
        op.version += 1;
        op.updated_at = Utc::now();
        *stored = op.clone();
        Ok(op)
    }

    fn get_last_operation(&self, instance_id: &str) -> Result<Operation> {
        self.lock()
            .operations
            .values()
            .filter(|o| o.instance_id == instance_id && o.state != OperationState::Pending)
            .max_by_key(|o| o.created_at)
            .cloned()
            .ok_or_else(|| PersistError::not_found("operation for instance", instance_id))
    }

    fn list_operations_in_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Operation>> {
        let mut ops: Vec<Operation> = self
            .lock()
            .operations
            .values()
            .filter(|o| o.created_at >= from && o.created_at <= to)
            .cloned()
            .collect();
        ops.sort_by_key(|o| o.created_at);
        Ok(ops)
    }

    fn count_by_type_state_plan(&self) -> Result<Vec<OperationCount>> {
        let mut counts: BTreeMap<_, u64> = BTreeMap::new();
        for o in self.lock().operations.values() {
            *counts.entry((o.kind, o.state, o.plan_id().to_string())).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((kind, state, plan_id), count)| OperationCount { kind, state, plan_id, count })
            .collect())
    }
}
