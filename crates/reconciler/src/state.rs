use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use subsync_cis::{AccountsSource, CisEvent, EventsSource};
use subsync_core::{bool_label, CisState, QueueElement, RuntimeId, RuntimeState, SubaccountId};
use subsync_persist::Storage;
use subsync_store::{EventWindow, SubaccountPriorityQueue};
use tracing::{debug, error, info, warn};

use crate::metrics;

/// Reconciler's record of one subaccount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubaccountState {
    pub cis_state: CisState,
    pub resources: BTreeMap<RuntimeId, RuntimeState>,
    /// Set when the last runtime went away; the next flush drops the record.
    pub pending_delete: bool,
}

/// True when CIS data is present and at least one runtime label differs from it.
///
/// Only the exact literal `"true"`/`"false"` counts as agreement; empty and
/// foreign values are outdated.
pub fn is_outdated(state: &SubaccountState) -> bool {
    if state.cis_state.modified_date <= 0 {
        return false;
    }
    let want = state.cis_state.beta_label();
    state.resources.values().any(|r| r.beta_enabled != want)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub upserts: usize,
    pub deletes: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountsReport {
    pub found: usize,
    pub not_found: usize,
    pub failures: usize,
}

struct Inner {
    subaccounts: HashMap<SubaccountId, SubaccountState>,
    window: EventWindow,
}

pub struct StateReconciler {
    inner: Mutex<Inner>,
    queue: Arc<SubaccountPriorityQueue>,
    storage: Storage,
    accounts: Arc<dyn AccountsSource>,
    events: Arc<dyn EventsSource>,
}

impl StateReconciler {
    pub fn new(
        queue: Arc<SubaccountPriorityQueue>,
        storage: Storage,
        accounts: Arc<dyn AccountsSource>,
        events: Arc<dyn EventsSource>,
        window: EventWindow,
    ) -> Self {
        let inner = Inner { subaccounts: HashMap::new(), window };
        Self { inner: Mutex::new(inner), queue, storage, accounts, events }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn accounts(&self) -> &Arc<dyn AccountsSource> { &self.accounts }

    pub fn queue(&self) -> &Arc<SubaccountPriorityQueue> { &self.queue }

    pub fn subaccount(&self, id: &SubaccountId) -> Option<SubaccountState> { self.lock().subaccounts.get(id).cloned() }

    pub fn len(&self) -> usize { self.lock().subaccounts.len() }

    pub fn is_empty(&self) -> bool { self.lock().subaccounts.is_empty() }

    pub fn subaccount_ids(&self) -> Vec<SubaccountId> { self.lock().subaccounts.keys().cloned().collect() }

    pub fn next_events_from(&self) -> i64 { self.lock().window.next_from_time() }

    pub fn window_bounds(&self) -> (i64, i64) {
        let g = self.lock();
        (g.window.last_from(), g.window.last_to())
    }

    fn enqueue_if_outdated(&self, id: &SubaccountId, state: &SubaccountState) {
        if is_outdated(state) {
            debug!(subaccount = %id, beta_enabled = state.cis_state.beta_enabled, "subaccount is outdated, enqueuing");
            self.queue.insert(QueueElement {
                subaccount_id: id.clone(),
                beta_enabled: bool_label(state.cis_state.beta_enabled).to_string(),
                modified_at: state.cis_state.modified_date,
            });
        } else {
            debug!(subaccount = %id, "subaccount is up to date");
        }
    }

    /// Record the observed label of one runtime.
    pub fn reconcile_resource_update(&self, id: &SubaccountId, runtime: &RuntimeId, state: RuntimeState) {
        let mut g = self.lock();
        let entry = g.subaccounts.entry(id.clone()).or_insert_with(|| {
            debug!(subaccount = %id, "subaccount not found in state, creating new state");
            SubaccountState::default()
        });
        entry.resources.insert(runtime.clone(), state);
        entry.pending_delete = false;
        let snapshot = entry.clone();
        self.enqueue_if_outdated(id, &snapshot);
        metrics::set_states(g.subaccounts.values());
    }

    /// Merge an account snapshot; ignored for unknown subaccounts and older data.
    pub fn reconcile_cis_account(&self, id: &SubaccountId, cis: CisState) {
        let mut g = self.lock();
        let Some(entry) = g.subaccounts.get_mut(id) else {
            warn!(subaccount = %id, "subaccount for account not found in in-memory state");
            return;
        };
        if cis.modified_date >= entry.cis_state.modified_date {
            entry.cis_state = cis;
            let snapshot = entry.clone();
            self.enqueue_if_outdated(id, &snapshot);
        }
        metrics::set_states(g.subaccounts.values());
    }

    /// Merge one CIS event and advance the event window.
    pub fn reconcile_cis_event(&self, event: &CisEvent) {
        let mut g = self.lock();
        g.window.update_to_time(event.action_time);
        let id = &event.subaccount_id;
        let Some(entry) = g.subaccounts.get_mut(id) else {
            warn!(subaccount = %id, action_time = event.action_time, "subaccount for event not found in in-memory state");
            return;
        };
        if event.action_time >= entry.cis_state.modified_date {
            entry.cis_state = event.cis_state();
            let snapshot = entry.clone();
            self.enqueue_if_outdated(id, &snapshot);
        }
        metrics::set_states(g.subaccounts.values());
    }

    pub fn delete_runtime_from_state(&self, id: &SubaccountId, runtime: &RuntimeId) {
        let mut g = self.lock();
        let Some(entry) = g.subaccounts.get_mut(id) else {
            warn!(subaccount = %id, "subaccount not found in state");
            return;
        };
        if entry.resources.remove(runtime).is_none() {
            warn!(subaccount = %id, runtime = %runtime, "runtime not found in subaccount");
            return;
        }
        entry.pending_delete = entry.resources.is_empty();
        metrics::set_states(g.subaccounts.values());
    }

    /// Rebuild the map from the durable mirror and the instances table.
    pub fn recreate_state_from_db(&self) -> anyhow::Result<()> {
        let rows = self.storage.states.list_states()?;
        let owned = self.storage.instances.distinct_subaccounts()?;
        let mut g = self.lock();
        for row in rows {
            let entry = g.subaccounts.entry(row.id.clone()).or_default();
            entry.cis_state = row.cis_state();
        }
        for (id, state) in g.subaccounts.iter_mut() {
            if !owned.contains(id) {
                warn!(subaccount = %id, "subaccount found in previous state but not in current instances, will be deleted");
                state.pending_delete = true;
            }
        }
        for id in owned {
            g.subaccounts.entry(id).or_insert_with_key(|id| {
                warn!(subaccount = %id, "subaccount not found in previous state but found in current instances");
                SubaccountState::default()
            });
        }
        info!(subaccounts = g.subaccounts.len(), "state recreated from storage");
        metrics::set_states(g.subaccounts.values());
        Ok(())
    }

    /// Write CIS state of every record to storage; drop records pending delete.
    pub fn store_state_in_db(&self) -> FlushReport {
        let mut g = self.lock();
        let mut report = FlushReport::default();
        let mut dropped = Vec::new();
        for (id, state) in g.subaccounts.iter() {
            if state.pending_delete {
                match self.storage.states.delete_state(id) {
                    Ok(()) => {
                        report.deletes += 1;
                        dropped.push(id.clone());
                        debug!(subaccount = %id, "state deleted from storage");
                    }
                    Err(e) => {
                        report.failures += 1;
                        error!(subaccount = %id, error = %e, "while deleting state from storage");
                    }
                }
            } else {
                match self.storage.states.upsert_state(&state.cis_state.to_row(id)) {
                    Ok(()) => report.upserts += 1,
                    Err(e) => {
                        report.failures += 1;
                        error!(subaccount = %id, error = %e, "while updating state in storage");
                    }
                }
            }
        }
        for id in dropped {
            g.subaccounts.remove(&id);
        }
        metrics::record_flush(&report);
        metrics::set_states(g.subaccounts.values());
        info!(upserts = report.upserts, deletes = report.deletes, failures = report.failures, "state synced to storage");
        report
    }

    /// Poll CIS accounts for every known subaccount. Network I/O runs outside the lock.
    pub async fn periodic_accounts_sync(&self) -> AccountsReport {
        let ids = self.subaccount_ids();
        info!(subaccounts = ids.len(), "running CIS accounts synchronization");
        let mut report = AccountsReport::default();
        for id in ids {
            match self.accounts.get_subaccount_data(&id).await {
                Ok(st) if st.is_empty() => {
                    warn!(subaccount = %id, "subaccount not found in CIS");
                    report.not_found += 1;
                }
                Ok(st) => {
                    report.found += 1;
                    self.reconcile_cis_account(&id, st);
                }
                Err(e) => {
                    report.failures += 1;
                    error!(subaccount = %id, error = %e, "while getting data for subaccount");
                }
            }
        }
        debug!(found = report.found, not_found = report.not_found, failures = report.failures, "accounts synchronization finished");
        report
    }

    /// Fetch events from `from` and merge those of known subaccounts.
    /// Returns false when the window was fetched only partially.
    pub async fn periodic_events_sync(&self, from: i64) -> bool {
        let known: std::collections::HashSet<SubaccountId> = self.subaccount_ids().into_iter().collect();
        info!(from, subaccounts = known.len(), "running CIS events synchronization");
        let (events, ok) = match self.events.fetch_events_window(from).await {
            Ok(evs) => (evs, true),
            Err(e) => {
                error!(error = %e.source, page = e.page, "while getting subaccount events");
                (e.partial, false)
            }
        };
        let raw = events.len();
        let relevant: Vec<CisEvent> = events.into_iter().filter(|e| known.contains(&e.subaccount_id)).collect();
        info!(raw, filtered = relevant.len(), "events fetched");
        for event in &relevant {
            self.reconcile_cis_event(event);
        }
        debug!(success = ok, last_to = self.window_bounds().1, "events synchronization finished");
        ok
    }

    /// One events-job tick: the window start only moves after a clean poll.
    pub async fn run_events_sync(&self) -> bool {
        let from = self.next_events_from();
        let ok = self.periodic_events_sync(from).await;
        if ok {
            self.lock().window.update_from_time(from);
        }
        let (last_from, last_to) = self.window_bounds();
        debug!(from, last_from, last_to, "events window advanced");
        ok
    }
}
