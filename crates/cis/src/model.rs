//! CIS wire types.

use serde::{Deserialize, Serialize};
use subsync_core::{CisState, SubaccountId, UsedForProduction};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetails {
    #[serde(default)]
    pub beta_enabled: bool,
    #[serde(default)]
    pub used_for_production: UsedForProduction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CisEvent {
    #[serde(rename = "actionTime")]
    pub action_time: i64,
    #[serde(rename = "entityId")]
    pub subaccount_id: SubaccountId,
    #[serde(rename = "eventType", default)]
    pub event_type: String,
    #[serde(default)]
    pub details: EventDetails,
}

impl CisEvent {
    /// CIS state carried by the event, stamped with its action time.
    pub fn cis_state(&self) -> CisState {
        CisState {
            beta_enabled: self.details.beta_enabled,
            used_for_production: self.details.used_for_production.clone(),
            modified_date: self.action_time,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CisEventsResponse {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub page_num: u32,
    #[serde(default)]
    pub events: Vec<CisEvent>,
}
