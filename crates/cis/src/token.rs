use std::time::{Duration, Instant};

use oauth2::basic::BasicClient;
use oauth2::{ClientId, ClientSecret, TokenResponse, TokenUrl};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CisError;

const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

struct Cached {
    value: String,
    expires_at: Option<Instant>,
}

/// OAuth2 client-credentials token, fetched lazily and cached until shortly before expiry.
pub struct TokenSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<Cached>>,
}

impl TokenSource {
    pub fn new(http: reqwest::Client, token_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            http,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String, CisError> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if c.expires_at.map_or(true, |t| Instant::now() + EXPIRY_MARGIN < t) {
                return Ok(c.value.clone());
            }
        }
        let token_url = TokenUrl::new(self.token_url.clone()).map_err(|e| CisError::Auth(format!("invalid token url: {e}")))?;
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_token_uri(token_url);
        let resp = client
            .exchange_client_credentials()
            .request_async(&self.http)
            .await
            .map_err(|e| CisError::Auth(format!("token request failed: {e}")))?;
        let expires_in = resp.expires_in();
        debug!(expires_in = ?expires_in, "fetched CIS access token");
        let value = resp.access_token().secret().clone();
        *cached = Some(Cached { value: value.clone(), expires_at: expires_in.map(|d| Instant::now() + d) });
        Ok(value)
    }
}
