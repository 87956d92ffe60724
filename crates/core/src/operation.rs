//! Durable operation record driven by the staged pipeline.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LastError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(rename = "provision")]
    Provision,
    #[serde(rename = "deprovision")]
    Deprovision,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "upgradeCluster")]
    UpgradeCluster,
}

impl OperationType {
    pub const ALL: [OperationType; 4] = [Self::Provision, Self::Deprovision, Self::Update, Self::UpgradeCluster];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::Update => "update",
            Self::UpgradeCluster => "upgradeCluster",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for OperationType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|t| t.as_str() == s).ok_or_else(|| anyhow::anyhow!("unknown operation type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "canceling")]
    Canceling,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "retrying")]
    Retrying,
}

impl OperationState {
    pub const ALL: [OperationState; 7] = [
        Self::Pending,
        Self::InProgress,
        Self::Succeeded,
        Self::Failed,
        Self::Canceling,
        Self::Canceled,
        Self::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Retrying => "retrying",
        }
    }

    /// Terminal states; an operation in one of them is immutable.
    pub fn is_final(&self) -> bool { matches!(self, Self::Succeeded | Self::Failed | Self::Canceled) }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for OperationState {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|t| t.as_str() == s).ok_or_else(|| anyhow::anyhow!("unknown operation state: {s}"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningParameters {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub global_account_id: String,
    #[serde(default)]
    pub subaccount_id: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    /// Optimistic-lock counter, bumped by every store update.
    pub version: i64,
    #[serde(rename = "type")]
    pub kind: OperationType,
    pub state: OperationState,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub instance_id: String,
    #[serde(default)]
    pub provisioning_parameters: ProvisioningParameters,
    /// Id of the operation started on the cluster driver, empty until started.
    #[serde(default)]
    pub driver_operation_id: String,
    #[serde(default)]
    pub orchestration_id: Option<String>,
    #[serde(default)]
    pub finished_stages: Vec<String>,
    #[serde(default)]
    pub last_error: LastError,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Operation {
    pub fn new(kind: OperationType, instance_id: impl Into<String>, params: ProvisioningParameters) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: 0,
            kind,
            state: OperationState::Pending,
            description: String::new(),
            created_at: now,
            updated_at: now,
            instance_id: instance_id.into(),
            provisioning_parameters: params,
            driver_operation_id: String::new(),
            orchestration_id: None,
            finished_stages: Vec::new(),
            last_error: LastError::default(),
            details: serde_json::Value::Null,
        }
    }

    /// False while the operation is pending, in progress, canceling or retrying.
    pub fn is_finished(&self) -> bool {
        !matches!(
            self.state,
            OperationState::InProgress | OperationState::Pending | OperationState::Canceling | OperationState::Retrying
        )
    }

    pub fn is_stage_finished(&self, stage: &str) -> bool { self.finished_stages.iter().any(|s| s == stage) }

    /// Record a stage as done; repeated calls keep a single entry.
    pub fn finish_stage(&mut self, stage: &str) {
        if !self.is_stage_finished(stage) {
            self.finished_stages.push(stage.to_string());
        }
    }

    pub fn plan_id(&self) -> &str { &self.provisioning_parameters.plan_id }
}

macro_rules! operation_variant {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Operation);

        impl $name {
            pub const KIND: OperationType = $kind;

            pub fn new(instance_id: impl Into<String>, params: ProvisioningParameters) -> Self {
                Self(Operation::new($kind, instance_id, params))
            }

            pub fn into_inner(self) -> Operation { self.0 }
        }

        impl Deref for $name {
            type Target = Operation;
            fn deref(&self) -> &Operation { &self.0 }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Operation { &mut self.0 }
        }

        impl From<$name> for Operation {
            fn from(v: $name) -> Operation { v.0 }
        }
    };
}

operation_variant!(
    /// Provisioning of a new runtime.
    ProvisioningOperation, OperationType::Provision
);
operation_variant!(
    /// Removal of a runtime and, finally, of its instance.
    DeprovisioningOperation, OperationType::Deprovision
);
operation_variant!(UpdatingOperation, OperationType::Update);
operation_variant!(UpgradeClusterOperation, OperationType::UpgradeCluster);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_stage_is_deduplicated() {
        let mut op = Operation::new(OperationType::Provision, "inst", ProvisioningParameters::default());
        op.finish_stage("start");
        op.finish_stage("runtime");
        op.finish_stage("start");
        assert_eq!(op.finished_stages, vec!["start", "runtime"]);
        assert!(op.is_stage_finished("runtime"));
    }

    #[test]
    fn finished_states() {
        let mut op = Operation::new(OperationType::Update, "inst", ProvisioningParameters::default());
        assert!(!op.is_finished());
        op.state = OperationState::Retrying;
        assert!(!op.is_finished());
        op.state = OperationState::Canceled;
        assert!(op.is_finished());
    }

    #[test]
    fn variants_carry_their_kind() {
        let op = DeprovisioningOperation::new("inst", ProvisioningParameters::default());
        assert_eq!(op.kind, OperationType::Deprovision);
        assert_eq!("upgradeCluster".parse::<OperationType>().unwrap(), OperationType::UpgradeCluster);
        assert_eq!("in progress".parse::<OperationState>().unwrap(), OperationState::InProgress);
    }
}
