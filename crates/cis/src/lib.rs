//! CIS clients: paginated subaccount events and per-subaccount account snapshots,
//! both behind an OAuth2 client-credentials token and a token-bucket limiter.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use subsync_core::{CisState, SubaccountId};

mod accounts;
mod client;
mod config;
mod error;
mod events;
pub mod model;
mod token;

pub use client::RateLimitedCisClient;
pub use config::CisEndpointConfig;
pub use error::{CisError, EventsError};
pub use model::{CisEvent, CisEventsResponse, EventDetails};
pub use token::TokenSource;

pub const EVENT_SERVICE_PATH: &str = "events/v1/events/central";
pub const SUBACCOUNT_SERVICE_PATH: &str = "accounts/v1/technical/subaccounts";
pub const EVENT_TYPES: &str = "Subaccount_Creation,Subaccount_Update";

/// Source of account snapshots, one subaccount at a time.
#[async_trait]
pub trait AccountsSource: Send + Sync {
    /// Current CIS state of a subaccount; an unknown subaccount yields the empty state.
    async fn get_subaccount_data(&self, id: &SubaccountId) -> Result<CisState, CisError>;
}

/// Source of subaccount change events.
#[async_trait]
pub trait EventsSource: Send + Sync {
    /// All events with `actionTime >= from`, oldest first. A failing page
    /// returns the events gathered so far alongside the error.
    async fn fetch_events_window(&self, from: i64) -> Result<Vec<CisEvent>, EventsError>;
}
