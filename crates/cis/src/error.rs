use reqwest::StatusCode;
use subsync_core::{Dependency, SyncError};

use crate::model::CisEvent;

#[derive(Debug, thiserror::Error)]
pub enum CisError {
    #[error("rate limited by CIS: server returned {status} status code, body: {body}")]
    Temporary { status: StatusCode, body: String },
    #[error("server returned {status} status code, body: {body}")]
    Status { status: StatusCode, body: String },
    #[error("while executing request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("while decoding CIS response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("while fetching token: {0}")]
    Auth(String),
    #[error("invalid CIS url: {0}")]
    Url(#[from] url::ParseError),
}

impl CisError {
    pub fn is_temporary(&self) -> bool { matches!(self, Self::Temporary { .. }) }

    /// Tag the error with the endpoint it came from.
    pub fn into_sync_error(self, dependency: Dependency) -> SyncError {
        let reason = self.to_string();
        if self.is_temporary() {
            SyncError::temporary(dependency, reason)
        } else {
            SyncError::permanent(dependency, reason)
        }
    }
}

/// A window fetch that stopped on a failing page.
#[derive(Debug, thiserror::Error)]
#[error("events window fetched partially ({} events before page {page} failed): {source}", .partial.len())]
pub struct EventsError {
    pub page: u32,
    pub partial: Vec<CisEvent>,
    #[source]
    pub source: CisError,
}
