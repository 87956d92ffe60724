//! Error kinds shared by the sync engine and the operation pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const OPERATION_TIMEOUT_MSG: &str = "operation has reached the time limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rate limited or otherwise retriable.
    Temporary,
    NotFound,
    Permanent,
    Timeout,
    PanicRecovered,
    Internal,
}

/// Component an error originates from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Dependency {
    CisEvents,
    CisAccounts,
    Db,
    ResourceApi,
    ClusterDriver,
    Step(String),
    #[default]
    Unknown,
}

impl Dependency {
    pub fn step(name: impl Into<String>) -> Self { Self::Step(name.into()) }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CisEvents => f.write_str("cis-events"),
            Self::CisAccounts => f.write_str("cis-accounts"),
            Self::Db => f.write_str("db"),
            Self::ResourceApi => f.write_str("resource-api"),
            Self::ClusterDriver => f.write_str("cluster-driver"),
            Self::Step(name) => write!(f, "step:{name}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

impl From<String> for Dependency {
    fn from(v: String) -> Self {
        match v.as_str() {
            "cis-events" => Self::CisEvents,
            "cis-accounts" => Self::CisAccounts,
            "db" => Self::Db,
            "resource-api" => Self::ResourceApi,
            "cluster-driver" => Self::ClusterDriver,
            "unknown" | "" => Self::Unknown,
            other => match other.strip_prefix("step:") {
                Some(name) => Self::Step(name.to_string()),
                None => Self::Unknown,
            },
        }
    }
}

impl From<Dependency> for String {
    fn from(v: Dependency) -> Self { v.to_string() }
}

/// Machine readable reason code stored next to the human reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    #[default]
    NotSet,
    Internal,
    Timeout,
    Temporary,
    NotFound,
    Permanent,
    PanicRecovered,
}

impl From<ErrorKind> for Code {
    fn from(k: ErrorKind) -> Self {
        match k {
            ErrorKind::Temporary => Code::Temporary,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::Permanent => Code::Permanent,
            ErrorKind::Timeout => Code::Timeout,
            ErrorKind::PanicRecovered => Code::PanicRecovered,
            ErrorKind::Internal => Code::Internal,
        }
    }
}

/// Classified error carrying its origin and a human reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} ({dependency})")]
pub struct SyncError {
    pub kind: ErrorKind,
    pub dependency: Dependency,
    pub reason: String,
}

impl SyncError {
    pub fn new(kind: ErrorKind, dependency: Dependency, reason: impl Into<String>) -> Self {
        Self { kind, dependency, reason: reason.into() }
    }

    pub fn temporary(dependency: Dependency, reason: impl Into<String>) -> Self { Self::new(ErrorKind::Temporary, dependency, reason) }
    pub fn not_found(dependency: Dependency, reason: impl Into<String>) -> Self { Self::new(ErrorKind::NotFound, dependency, reason) }
    pub fn permanent(dependency: Dependency, reason: impl Into<String>) -> Self { Self::new(ErrorKind::Permanent, dependency, reason) }
    pub fn timeout(dependency: Dependency, reason: impl Into<String>) -> Self { Self::new(ErrorKind::Timeout, dependency, reason) }
    pub fn panic_recovered(dependency: Dependency, reason: impl Into<String>) -> Self { Self::new(ErrorKind::PanicRecovered, dependency, reason) }

    pub fn is_temporary(&self) -> bool { self.kind == ErrorKind::Temporary }
    pub fn is_not_found(&self) -> bool { self.kind == ErrorKind::NotFound }
}

/// Returns true when any error in the chain is a temporary `SyncError`.
pub fn is_temporary(err: &anyhow::Error) -> bool {
    err.chain().filter_map(|e| e.downcast_ref::<SyncError>()).any(SyncError::is_temporary)
}

/// Returns true when any error in the chain is a not-found `SyncError`.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().filter_map(|e| e.downcast_ref::<SyncError>()).any(SyncError::is_not_found)
}

/// Persisted error record of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    #[serde(default)]
    pub message: String,
    /// Human readable reason, e.g. "operation has reached the time limit".
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub code: Code,
    #[serde(default)]
    pub dependency: Dependency,
}

impl LastError {
    pub fn is_empty(&self) -> bool { *self == Self::default() }

    pub fn timeout() -> Self {
        Self {
            message: OPERATION_TIMEOUT_MSG.to_string(),
            reason: OPERATION_TIMEOUT_MSG.to_string(),
            code: Code::Timeout,
            dependency: Dependency::Unknown,
        }
    }

    /// Classify an error returned by a step.
    pub fn from_error(err: &anyhow::Error, step_name: &str) -> Self {
        let message = format!("{err:#}");
        if let Some(se) = err.chain().find_map(|e| e.downcast_ref::<SyncError>()) {
            let dependency = match &se.dependency {
                Dependency::Unknown => Dependency::step(step_name),
                d => d.clone(),
            };
            return Self { message, reason: se.reason.clone(), code: se.kind.into(), dependency };
        }
        if message.contains(OPERATION_TIMEOUT_MSG) {
            return Self { reason: OPERATION_TIMEOUT_MSG.to_string(), message, code: Code::Timeout, dependency: Dependency::step(step_name) };
        }
        Self { reason: err.to_string(), message, code: Code::Internal, dependency: Dependency::step(step_name) }
    }
}

impl From<&SyncError> for LastError {
    fn from(e: &SyncError) -> Self {
        Self { message: e.to_string(), reason: e.reason.clone(), code: e.kind.into(), dependency: e.dependency.clone() }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [reason={}, component={}]", self.message, self.reason, self.dependency)
    }
}
