use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, error};

use crate::client::RateLimitedCisClient;
use crate::error::{CisError, EventsError};
use crate::model::{CisEvent, CisEventsResponse};
use crate::{EventsSource, EVENT_SERVICE_PATH, EVENT_TYPES};

impl RateLimitedCisClient {
    async fn fetch_events_page(&self, page: u32, from: i64) -> Result<CisEventsResponse, CisError> {
        let mut url = self.url(EVENT_SERVICE_PATH)?;
        url.query_pairs_mut()
            .append_pair("eventType", EVENT_TYPES)
            .append_pair("pageSize", &self.config.page_size.to_string())
            .append_pair("pageNum", &page.to_string())
            .append_pair("fromActionTime", &from.to_string())
            .append_pair("sortField", "actionTime")
            .append_pair("sortOrder", "ASC");
        let resp = self.get(url).await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::status_error(resp).await);
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(CisError::Decode)
    }
}

#[async_trait]
impl EventsSource for RateLimitedCisClient {
    async fn fetch_events_window(&self, from: i64) -> Result<Vec<CisEvent>, EventsError> {
        let mut events = Vec::new();
        let mut page = 0u32;
        loop {
            let resp = match self.fetch_events_page(page, from).await {
                Ok(r) => r,
                Err(source) => {
                    self.record("failure");
                    error!(page, fetched = events.len(), from, error = %source, "events window fetched partially");
                    return Err(EventsError { page, partial: events, source });
                }
            };
            self.record("success");
            events.extend(resp.events);
            page += 1;
            if page >= resp.total_pages {
                break;
            }
        }
        // inclusive lower bound
        events.retain(|e| e.action_time >= from);
        debug!(pages = page, events = events.len(), from, "events window fetched");
        Ok(events)
    }
}
