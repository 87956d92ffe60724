//! Subsync reconciler: merges resource observations, CIS account snapshots and
//! CIS events into one in-memory view and schedules label updates.

#![forbid(unsafe_code)]

mod handler;
mod jobs;
pub mod metrics;
mod service;
mod state;

pub use handler::InformerHandler;
pub use jobs::{spawn_jobs, JobIntervals};
pub use service::{SyncConfig, SyncService};
pub use state::{is_outdated, AccountsReport, FlushReport, StateReconciler, SubaccountState};
