//! Sync metrics emitted through the `metrics` facade.

use metrics::{counter, gauge};
use subsync_core::UsedForProduction;
use subsync_store::QueueHooks;

use crate::state::{FlushReport, SubaccountState};

pub const QUEUE_SIZE: &str = "subaccount_sync_priority_queue_size";
pub const QUEUE_OPS: &str = "subaccount_sync_priority_queue_ops";
pub const TIME_IN_QUEUE: &str = "subaccount_sync_time_in_queue_ms";
pub const STATES: &str = "subaccount_sync_in_memory_states";
pub const INFORMER: &str = "subaccount_sync_informer";
pub const DRY_RUN: &str = "subaccount_sync_dry_run";
pub const STORAGE_SYNC: &str = "subaccount_sync_storage_sync";

/// Queue observers publishing size, operation counts and time in queue.
pub fn queue_hooks() -> QueueHooks {
    QueueHooks {
        on_insert: Some(Box::new(|size| {
            gauge!(QUEUE_SIZE, size as f64);
            counter!(QUEUE_OPS, 1u64, "operation" => "insert");
        })),
        on_extract: Some(Box::new(|size, waited_ns| {
            gauge!(QUEUE_SIZE, size as f64);
            counter!(QUEUE_OPS, 1u64, "operation" => "extract");
            gauge!(TIME_IN_QUEUE, waited_ns as f64 / 1_000_000.0);
        })),
    }
}

pub fn set_dry_run(dry_run: bool) { gauge!(DRY_RUN, if dry_run { 1.0 } else { 0.0 }); }

pub fn informer_event(event: &'static str) { counter!(INFORMER, 1u64, "event" => event); }

pub(crate) fn record_flush(report: &FlushReport) {
    counter!(STORAGE_SYNC, report.upserts as u64, "result" => "upsert");
    counter!(STORAGE_SYNC, report.deletes as u64, "result" => "delete");
    counter!(STORAGE_SYNC, report.failures as u64, "result" => "failure");
}

/// Aggregates behind the `in_memory_states` gauge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StateCounts {
    pub total: usize,
    pub beta_true: usize,
    pub beta_false: usize,
    pub cis_states: usize,
    pub resources_states: usize,
    pub pending_delete: usize,
    pub runtimes: usize,
    pub production: usize,
    pub not_production: usize,
    pub other_production: usize,
}

impl StateCounts {
    pub fn collect<'a>(states: impl Iterator<Item = &'a SubaccountState>) -> Self {
        let mut c = Self::default();
        for s in states {
            c.total += 1;
            if s.cis_state.beta_enabled {
                c.beta_true += 1;
            } else {
                c.beta_false += 1;
            }
            if !s.cis_state.is_empty() {
                c.cis_states += 1;
            }
            if !s.resources.is_empty() {
                c.resources_states += 1;
            }
            if s.pending_delete {
                c.pending_delete += 1;
            }
            c.runtimes += s.resources.len();
            match s.cis_state.used_for_production {
                UsedForProduction::UsedForProduction => c.production += 1,
                UsedForProduction::NotUsedForProduction => c.not_production += 1,
                _ => c.other_production += 1,
            }
        }
        c
    }
}

pub(crate) fn set_states<'a>(states: impl Iterator<Item = &'a SubaccountState>) {
    let c = StateCounts::collect(states);
    let pairs: [(&'static str, &'static str, usize); 10] = [
        ("total", "total", c.total),
        ("betaEnabled", "true", c.beta_true),
        ("betaEnabled", "false", c.beta_false),
        ("total", "cis-states", c.cis_states),
        ("total", "resources-states", c.resources_states),
        ("total", "pending-delete", c.pending_delete),
        ("total", "runtimes", c.runtimes),
        ("USED_FOR_PRODUCTION", "USED_FOR_PRODUCTION", c.production),
        ("USED_FOR_PRODUCTION", "NOT_USED_FOR_PRODUCTION", c.not_production),
        ("USED_FOR_PRODUCTION", "others", c.other_production),
    ];
    for (kind, value, n) in pairs {
        gauge!(STATES, n as f64, "type" => kind, "value" => value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subsync_core::{CisState, RuntimeState};

    #[test]
    fn counts_by_bucket() {
        let mut a = SubaccountState::default();
        a.cis_state = CisState { beta_enabled: true, used_for_production: UsedForProduction::UsedForProduction, modified_date: 3 };
        a.resources.insert("r1".into(), RuntimeState::new("true"));
        a.resources.insert("r2".into(), RuntimeState::new(""));
        let b = SubaccountState { pending_delete: true, ..Default::default() };
        let c = StateCounts::collect([a, b].iter());
        assert_eq!(c.total, 2);
        assert_eq!((c.beta_true, c.beta_false), (1, 1));
        assert_eq!((c.cis_states, c.resources_states, c.pending_delete), (1, 1, 1));
        assert_eq!(c.runtimes, 2);
        assert_eq!((c.production, c.not_production, c.other_production), (1, 0, 1));
    }
}
