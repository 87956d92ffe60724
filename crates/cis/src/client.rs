use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::counter;
use reqwest::{Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::config::CisEndpointConfig;
use crate::error::CisError;
use crate::token::TokenSource;

/// HTTP client for one CIS endpoint: every request waits on the limiter first.
pub struct RateLimitedCisClient {
    pub(crate) endpoint: &'static str,
    pub(crate) config: CisEndpointConfig,
    http: reqwest::Client,
    limiter: Option<DefaultDirectRateLimiter>,
    token: Option<TokenSource>,
}

impl RateLimitedCisClient {
    /// `endpoint` names the client in logs and metrics (`events`, `accounts`).
    pub fn new(endpoint: &'static str, config: CisEndpointConfig) -> Result<Self, CisError> {
        let http = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        let burst = NonZeroU32::new(config.max_requests_per_interval).unwrap_or(NonZeroU32::MIN);
        let limiter = Quota::with_period(config.rate_limiting_interval).map(|q| RateLimiter::direct(q.allow_burst(burst)));
        if limiter.is_none() {
            warn!(endpoint, "rate limiting interval is zero; CIS requests are not limited");
        }
        let token = (!config.auth_url.is_empty())
            .then(|| TokenSource::new(http.clone(), &config.auth_url, &config.client_id, &config.client_secret));
        Ok(Self { endpoint, config, http, limiter, token })
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url, CisError> {
        Ok(Url::parse(&format!("{}/{}", self.config.service_url.trim_end_matches('/'), path))?)
    }

    pub(crate) async fn get(&self, url: Url) -> Result<Response, CisError> {
        if let Some(l) = &self.limiter {
            l.until_ready().await;
        }
        let mut req = self.http.get(url);
        if let Some(t) = &self.token {
            req = req.bearer_auth(t.token().await?);
        }
        debug!(endpoint = self.endpoint, "sending CIS request");
        Ok(req.send().await?)
    }

    /// Consume a non-200 response into an error carrying its body.
    pub(crate) async fn status_error(resp: Response) -> CisError {
        let status = resp.status();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(_) => "response body is unreadable".to_string(),
        };
        if status == StatusCode::TOO_MANY_REQUESTS {
            CisError::Temporary { status, body }
        } else {
            CisError::Status { status, body }
        }
    }

    pub(crate) fn record(&self, status: &'static str) {
        counter!("subaccount_sync_cis_requests", 1u64, "endpoint" => self.endpoint, "status" => status);
    }
}
