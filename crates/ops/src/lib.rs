//! Subsync ops: staged execution of durable operations.
//!
//! A [`StagedManager`] walks an operation through named stages of steps,
//! checkpointing finished stages in the Operations Store and publishing
//! lifecycle events. A [`WorkQueue`] drives managers from a pool of workers.

#![forbid(unsafe_code)]

pub mod driver;
pub mod events;
mod manager;
pub mod metrics;
mod queue;
mod staged;
mod step;
pub mod steps;
pub mod workflow;

pub use driver::{ClusterDriver, DriverState, DriverStatus, HttpClusterDriver};
pub use events::{EventKind, OperationEvent, PubSub, Publisher, StepProcessed};
pub use manager::{OperationManager, STORAGE_RETRY};
pub use queue::{Executor, WorkQueue};
pub use staged::{StagedManager, StagedManagerConfig, LOAD_RETRY, SAVE_RETRY};
pub use step::{Step, StepCondition, StepOutcome};
