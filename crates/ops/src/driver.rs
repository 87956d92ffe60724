//! Cluster driver: the opaque backend that performs the runtime work of an operation.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use subsync_core::{Dependency, Operation, SyncError};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatus {
    pub state: DriverState,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Start the runtime work for `operation`; returns the driver operation id.
    async fn start(&self, operation: &Operation) -> Result<String>;
    async fn operation_status(&self, driver_operation_id: &str) -> Result<DriverStatus>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    operation_id: &'a str,
    instance_id: &'a str,
    plan_id: &'a str,
    global_account_id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Deserialize)]
struct StartResponse {
    id: String,
}

/// JSON-over-HTTP driver: `POST {base}/operations` and `GET {base}/operations/{id}`.
pub struct HttpClusterDriver {
    base: Url,
    http: reqwest::Client,
}

impl HttpClusterDriver {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/'))).context("parsing driver url")?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, http })
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let reason = format!("driver returned {status}: {body}");
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SyncError::temporary(Dependency::ClusterDriver, reason).into());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::not_found(Dependency::ClusterDriver, reason).into());
        }
        Err(SyncError::permanent(Dependency::ClusterDriver, reason).into())
    }
}

/// Transport failures are worth another attempt.
fn transport(e: reqwest::Error) -> anyhow::Error { SyncError::temporary(Dependency::ClusterDriver, e.to_string()).into() }

#[async_trait]
impl ClusterDriver for HttpClusterDriver {
    async fn start(&self, operation: &Operation) -> Result<String> {
        let url = self.base.join("operations")?;
        let req = StartRequest {
            operation_id: &operation.id,
            instance_id: &operation.instance_id,
            plan_id: operation.plan_id(),
            global_account_id: &operation.provisioning_parameters.global_account_id,
            kind: operation.kind.as_str(),
        };
        let resp = self.http.post(url).json(&req).send().await.map_err(transport)?;
        let started: StartResponse = Self::check(resp).await?.json().await.map_err(transport)?;
        debug!(operation = %operation.id, driver_operation = %started.id, "driver operation started");
        Ok(started.id)
    }

    async fn operation_status(&self, driver_operation_id: &str) -> Result<DriverStatus> {
        let url = self.base.join(&format!("operations/{driver_operation_id}"))?;
        let resp = self.http.get(url).send().await.map_err(transport)?;
        Ok(Self::check(resp).await?.json().await.map_err(transport)?)
    }
}
