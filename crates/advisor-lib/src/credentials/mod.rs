//! Cross-account credential resolution
//!
//! - `trust`: directed trust edges resolved once per run into a lookup table
//! - `broker`: walks a target's chain through a [`RoleAssumer`] and caches the result

pub mod broker;
pub mod trust;

pub use broker::{BrokerConfig, CredentialBroker};
pub use trust::{Principal, TrustEdge, TrustGraph, TrustTable};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Role the collector assumes in source accounts
pub const DEFAULT_SOURCE_ROLE: &str = "PostgresMetricsUploader";

/// A role in a specific account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    pub account_id: String,
    pub role_name: String,
}

impl RoleRef {
    pub fn new(account_id: impl Into<String>, role_name: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            role_name: role_name.into(),
        }
    }

    pub fn arn(&self) -> String {
        format!("arn:aws:iam::{}:role/{}", self.account_id, self.role_name)
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.arn())
    }
}

/// Short-lived credential scoped to one account.
///
/// Read-only to everyone but the broker: fields are private and there is no
/// way to extend the expiry after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct ScopedCredential {
    account_id: String,
    role_arn: String,
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expires_at: DateTime<Utc>,
}

impl ScopedCredential {
    pub fn new(
        role: &RoleRef,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: role.account_id.clone(),
            role_arn: role.arn(),
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.into(),
            expires_at,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn role_arn(&self) -> &str {
        &self.role_arn
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True when the credential lapses within `margin` of `now`
    pub fn expires_within(&self, margin: ChronoDuration, now: DateTime<Utc>) -> bool {
        now + margin >= self.expires_at
    }
}

// Secrets never reach logs
impl fmt::Debug for ScopedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCredential")
            .field("account_id", &self.account_id)
            .field("role_arn", &self.role_arn)
            .field("access_key_id", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssumeRoleError {
    #[error("access denied: {0}")]
    Denied(String),

    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// The identity provider's single capability: exchange a caller identity for
/// a temporary credential in another account.
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    /// `caller = None` assumes from the process's own (local) principal
    async fn assume_role(
        &self,
        caller: Option<&ScopedCredential>,
        role: &RoleRef,
        session_name: &str,
    ) -> Result<ScopedCredential, AssumeRoleError>;
}
