//! Error taxonomy for collection, persistence and estimation
//!
//! Target-level errors (`AuthError`, `EnumError`) stop collection for one
//! target only. `FetchError` never escapes a node: it is carried next to the
//! node's record. Nothing here aborts a whole run.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Credential resolution failures (fatal per target)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("no trust chain reaches account {account_id}")]
    Untrusted { account_id: String },

    #[error("credential for account {account_id} expired at {expired_at}")]
    Expired {
        account_id: String,
        expired_at: DateTime<Utc>,
    },

    #[error("assuming {role_arn} failed: {reason}")]
    AssumeRoleFailed { role_arn: String, reason: String },
}

/// Node enumeration failures (fatal per target)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnumError {
    #[error("resource directory unreachable for {target}: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("malformed resource description for {target}: {reason}")]
    Malformed { target: String, reason: String },
}

/// Per-node telemetry failures. Recorded, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("throttled by telemetry api after {attempts} attempts")]
    Throttled { attempts: u32 },

    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("fetch timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("credential for account {account_id} expired during fetch")]
    CredentialExpired { account_id: String },

    #[error("collection cancelled before fetch started")]
    Cancelled,

    #[error("telemetry api error: {reason}")]
    Upstream { reason: String },
}

impl FetchError {
    /// Label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Throttled { .. } => "throttled",
            FetchError::PermissionDenied { .. } => "permission_denied",
            FetchError::Timeout { .. } => "timeout",
            FetchError::CredentialExpired { .. } => "credential_expired",
            FetchError::Cancelled => "cancelled",
            FetchError::Upstream { .. } => "upstream",
        }
    }

    /// Whether a later run (or a re-drive) could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Throttled { .. } | FetchError::Timeout { .. } | FetchError::Upstream { .. }
        )
    }

    /// Whether this failure leaves a node with nothing usable
    pub fn is_fatal_for_node(&self) -> bool {
        matches!(
            self,
            FetchError::PermissionDenied { .. }
                | FetchError::CredentialExpired { .. }
                | FetchError::Cancelled
        )
    }
}

/// Why a whole target produced no (or only some) nodes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Enum(#[from] EnumError),

    #[error("collection cancelled before target was processed")]
    Cancelled,

    #[error("target collection aborted: {0}")]
    Aborted(String),
}

impl TargetError {
    pub fn kind(&self) -> &'static str {
        match self {
            TargetError::Auth(AuthError::InvalidTarget { .. }) => "invalid_target",
            TargetError::Auth(AuthError::Untrusted { .. }) => "untrusted",
            TargetError::Auth(AuthError::Expired { .. }) => "expired",
            TargetError::Auth(AuthError::AssumeRoleFailed { .. }) => "assume_role_failed",
            TargetError::Enum(EnumError::Unreachable { .. }) => "unreachable",
            TargetError::Enum(EnumError::Malformed { .. }) => "malformed",
            TargetError::Cancelled => "cancelled",
            TargetError::Aborted(_) => "aborted",
        }
    }
}

/// Record sink write failures. Retried by the caller, never dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("object store unavailable writing {key}: {reason}")]
    Unavailable { key: String, reason: String },

    #[error("failed to encode record {node_id}: {reason}")]
    Encode { node_id: String, reason: String },
}

/// Record sink read failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("object store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("failed to decode {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Reasons a record cannot be turned into a capacity estimate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EstimateError {
    #[error("record for {node_id} has no samples")]
    NoSamples { node_id: String },

    #[error("no reference data for instance class {instance_class}")]
    UnknownInstanceClass { instance_class: String },

    #[error("no ACU price for region {region}")]
    UnknownRegion { region: String },
}

/// Pricing/instance reference data could not be loaded
#[derive(Debug, Error)]
pub enum ReferenceDataError {
    #[error("failed to read reference data: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse reference data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid reference data: {0}")]
    Invalid(String),
}
