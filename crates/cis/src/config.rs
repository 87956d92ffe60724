use std::time::Duration;

/// Connection settings of one CIS endpoint.
#[derive(Debug, Clone)]
pub struct CisEndpointConfig {
    pub client_id: String,
    pub client_secret: String,
    /// OAuth2 token URL; empty disables authentication.
    pub auth_url: String,
    pub service_url: String,
    pub page_size: u32,
    pub rate_limiting_interval: Duration,
    pub max_requests_per_interval: u32,
    /// Attempts made on a rate-limited account request before giving up.
    pub max_retries: u32,
    pub retry_sleep: Duration,
    pub request_timeout: Duration,
}

impl Default for CisEndpointConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: String::new(),
            service_url: String::new(),
            page_size: 150,
            rate_limiting_interval: Duration::from_secs(2),
            max_requests_per_interval: 5,
            max_retries: 3,
            retry_sleep: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}
