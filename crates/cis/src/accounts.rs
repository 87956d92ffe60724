use async_trait::async_trait;
use reqwest::StatusCode;
use subsync_core::{CisState, SubaccountId};
use tracing::{debug, warn};

use crate::client::RateLimitedCisClient;
use crate::error::CisError;
use crate::{AccountsSource, SUBACCOUNT_SERVICE_PATH};

impl RateLimitedCisClient {
    async fn fetch_subaccount(&self, id: &SubaccountId) -> Result<CisState, CisError> {
        let mut url = self.url(SUBACCOUNT_SERVICE_PATH)?;
        url.path_segments_mut()
            .map_err(|_| CisError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .push(id.as_str());
        let resp = self.get(url).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => {
                self.record("notfound");
                Ok(CisState::default())
            }
            StatusCode::OK => {
                let body = resp.bytes().await?;
                let st = serde_json::from_slice(&body).map_err(CisError::Decode)?;
                self.record("success");
                Ok(st)
            }
            _ => Err(Self::status_error(resp).await),
        }
    }
}

#[async_trait]
impl AccountsSource for RateLimitedCisClient {
    async fn get_subaccount_data(&self, id: &SubaccountId) -> Result<CisState, CisError> {
        let mut attempt = 1;
        loop {
            match self.fetch_subaccount(id).await {
                Ok(st) => {
                    debug!(subaccount = %id, "fetched subaccount data");
                    return Ok(st);
                }
                Err(e) if e.is_temporary() && attempt < self.config.max_retries => {
                    warn!(subaccount = %id, attempt, error = %e, "CIS accounts rate limited, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_sleep).await;
                }
                Err(e) => {
                    self.record("failure");
                    return Err(e);
                }
            }
        }
    }
}
