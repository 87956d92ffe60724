//! Subsync core types: subaccount feature state, queue elements, instances and operations.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod operation;

pub use error::{Code, Dependency, ErrorKind, LastError, SyncError, OPERATION_TIMEOUT_MSG};
pub use operation::{
    DeprovisioningOperation, Operation, OperationState, OperationType, ProvisioningOperation,
    ProvisioningParameters, UpdatingOperation, UpgradeClusterOperation,
};

/// Label carrying the owning subaccount on every runtime resource.
pub const SUBACCOUNT_ID_LABEL: &str = "kyma-project.io/subaccount-id";
/// Label carrying the runtime id on every runtime resource.
pub const RUNTIME_ID_LABEL: &str = "kyma-project.io/runtime-id";
/// Label the engine keeps in agreement with CIS `betaEnabled`.
pub const BETA_ENABLED_LABEL: &str = "operator.kyma-project.io/beta";

pub mod prelude {
    pub use super::{
        CisState, Instance, QueueElement, RuntimeId, RuntimeState, SubaccountId, SubaccountStateRow,
        UsedForProduction,
    };
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
            pub fn as_str(&self) -> &str { &self.0 }
            pub fn is_empty(&self) -> bool { self.0.is_empty() }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
        }

        impl From<&str> for $name {
            fn from(v: &str) -> Self { Self(v.to_string()) }
        }

        impl From<String> for $name {
            fn from(v: String) -> Self { Self(v) }
        }
    };
}

string_id!(
    /// Opaque tenancy key.
    SubaccountId
);
string_id!(
    /// Opaque id of one managed runtime (one labeled resource).
    RuntimeId
);

/// CIS production classifier. Unknown values are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UsedForProduction {
    #[default]
    Unset,
    NotUsedForProduction,
    UsedForProduction,
    Other(String),
}

impl UsedForProduction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unset => "",
            Self::NotUsedForProduction => "NOT_USED_FOR_PRODUCTION",
            Self::UsedForProduction => "USED_FOR_PRODUCTION",
            Self::Other(v) => v.as_str(),
        }
    }
}

impl From<&str> for UsedForProduction {
    fn from(v: &str) -> Self {
        match v {
            "" | "UNSET" => Self::Unset,
            "NOT_USED_FOR_PRODUCTION" => Self::NotUsedForProduction,
            "USED_FOR_PRODUCTION" => Self::UsedForProduction,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for UsedForProduction {
    fn from(v: String) -> Self { Self::from(v.as_str()) }
}

impl From<UsedForProduction> for String {
    fn from(v: UsedForProduction) -> Self { v.as_str().to_string() }
}

impl fmt::Display for UsedForProduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Authoritative feature state of one subaccount as reported by CIS.
///
/// `modified_date` is epoch milliseconds; zero means "no CIS data yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CisState {
    #[serde(default)]
    pub beta_enabled: bool,
    #[serde(default)]
    pub used_for_production: UsedForProduction,
    #[serde(default)]
    pub modified_date: i64,
}

impl CisState {
    pub fn is_empty(&self) -> bool { *self == Self::default() }

    /// Literal label value matching `beta_enabled`.
    pub fn beta_label(&self) -> &'static str { bool_label(self.beta_enabled) }

    pub fn to_row(&self, id: &SubaccountId) -> SubaccountStateRow {
        SubaccountStateRow {
            id: id.clone(),
            beta_enabled: self.beta_label().to_string(),
            used_for_production: self.used_for_production.as_str().to_string(),
            modified_at: self.modified_date,
        }
    }
}

pub fn bool_label(v: bool) -> &'static str { if v { "true" } else { "false" } }

/// Observed state of one runtime resource. The label value is kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub beta_enabled: String,
}

impl RuntimeState {
    pub fn new(beta_enabled: impl Into<String>) -> Self { Self { beta_enabled: beta_enabled.into() } }
}

/// Pending label update for all runtimes of a subaccount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueElement {
    pub subaccount_id: SubaccountId,
    /// `"true"` or `"false"`
    pub beta_enabled: String,
    /// CIS modification time, epoch milliseconds; queue priority.
    pub modified_at: i64,
}

/// Durable row mirroring the CIS-derived part of a subaccount state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountStateRow {
    pub id: SubaccountId,
    pub beta_enabled: String,
    pub used_for_production: String,
    pub modified_at: i64,
}

impl SubaccountStateRow {
    pub fn cis_state(&self) -> CisState {
        CisState {
            beta_enabled: self.beta_enabled == "true",
            used_for_production: UsedForProduction::from(self.used_for_production.as_str()),
            modified_date: self.modified_at,
        }
    }
}

/// Service instance owned by a subaccount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub subaccount_id: SubaccountId,
    pub runtime_id: Option<RuntimeId>,
    pub plan_id: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(instance_id: impl Into<String>, subaccount_id: impl Into<SubaccountId>, plan_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            subaccount_id: subaccount_id.into(),
            runtime_id: None,
            plan_id: plan_id.into(),
            parameters: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_runtime(mut self, runtime_id: impl Into<RuntimeId>) -> Self {
        self.runtime_id = Some(runtime_id.into());
        self
    }
}

pub fn now_millis() -> i64 { Utc::now().timestamp_millis() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cis_state_decodes_account_payload() {
        let raw = r#"{"betaEnabled":true,"usedForProduction":"USED_FOR_PRODUCTION","modifiedDate":1700000000000}"#;
        let st: CisState = serde_json::from_str(raw).unwrap();
        assert!(st.beta_enabled);
        assert_eq!(st.used_for_production, UsedForProduction::UsedForProduction);
        assert_eq!(st.modified_date, 1_700_000_000_000);
        assert_eq!(st.beta_label(), "true");
    }

    #[test]
    fn unknown_classifier_is_kept() {
        let v = UsedForProduction::from("SOMETHING_NEW");
        assert_eq!(v.as_str(), "SOMETHING_NEW");
        assert_eq!(UsedForProduction::from("UNSET"), UsedForProduction::Unset);
    }

    #[test]
    fn row_roundtrip_keeps_cis_fields() {
        let st = CisState { beta_enabled: false, used_for_production: UsedForProduction::NotUsedForProduction, modified_date: 5 };
        let row = st.to_row(&SubaccountId::from("sa1"));
        assert_eq!(row.beta_enabled, "false");
        assert_eq!(row.cis_state(), st);
    }
}
