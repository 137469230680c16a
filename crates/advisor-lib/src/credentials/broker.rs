//! Credential broker
//!
//! Resolves a target account to a scoped credential by assuming each hop of
//! its trust chain in order. Only the final credential is cached, keyed by
//! account id; intermediate hop credentials are dropped as soon as the next
//! hop has been assumed.

use super::{RoleAssumer, RoleRef, ScopedCredential, TrustTable};
use crate::error::AuthError;
use crate::models::Target;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Session name presented on every assume-role call
    pub session_name: String,
    /// Re-assume a cached credential this long before it lapses
    pub refresh_margin: ChronoDuration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            session_name: "FleetCollection".to_string(),
            refresh_margin: ChronoDuration::minutes(5),
        }
    }
}

pub struct CredentialBroker {
    assumer: Arc<dyn RoleAssumer>,
    table: TrustTable,
    cache: DashMap<String, ScopedCredential>,
    config: BrokerConfig,
}

impl CredentialBroker {
    pub fn new(assumer: Arc<dyn RoleAssumer>, table: TrustTable, config: BrokerConfig) -> Self {
        Self {
            assumer,
            table,
            cache: DashMap::new(),
            config,
        }
    }

    /// Credential for the target's account.
    ///
    /// A cached credential is reused until it enters the refresh margin. If
    /// renewal fails while the cached one is still valid, the cached one is
    /// returned; if it has already lapsed, the entry is evicted and
    /// `AuthError::Expired` is returned.
    pub async fn resolve(&self, target: &Target) -> Result<ScopedCredential, AuthError> {
        target
            .validate()
            .map_err(|reason| AuthError::InvalidTarget {
                target: target.to_string(),
                reason,
            })?;

        let account_id = target.account_id();
        let chain = self
            .table
            .chain_for(account_id)
            .ok_or_else(|| AuthError::Untrusted {
                account_id: account_id.to_string(),
            })?;

        let now = Utc::now();
        let cached = self.cache.get(account_id).map(|entry| entry.value().clone());
        if let Some(cred) = &cached {
            if !cred.expires_within(self.config.refresh_margin, now) {
                debug!(account_id = %account_id, "Using cached credential");
                return Ok(cred.clone());
            }
        }

        match self.assume_chain(chain).await {
            Ok(cred) => {
                info!(
                    account_id = %account_id,
                    hops = chain.len(),
                    expires_at = %cred.expires_at(),
                    "Resolved scoped credential"
                );
                self.cache.insert(account_id.to_string(), cred.clone());
                Ok(cred)
            }
            Err(err) => match cached {
                Some(cred) if !cred.is_expired_at(Utc::now()) => {
                    warn!(
                        account_id = %account_id,
                        error = %err,
                        "Credential renewal failed, reusing cached credential"
                    );
                    Ok(cred)
                }
                Some(cred) => {
                    self.cache.remove(account_id);
                    Err(AuthError::Expired {
                        account_id: account_id.to_string(),
                        expired_at: cred.expires_at(),
                    })
                }
                None => Err(err),
            },
        }
    }

    /// Cached credential for an account without contacting the identity service
    pub fn cached(&self, account_id: &str) -> Result<Option<ScopedCredential>, AuthError> {
        let Some(cred) = self.cache.get(account_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        if cred.is_expired() {
            self.cache.remove(account_id);
            return Err(AuthError::Expired {
                account_id: account_id.to_string(),
                expired_at: cred.expires_at(),
            });
        }
        Ok(Some(cred))
    }

    pub fn invalidate(&self, account_id: &str) {
        self.cache.remove(account_id);
    }

    async fn assume_chain(&self, chain: &[RoleRef]) -> Result<ScopedCredential, AuthError> {
        let mut current: Option<ScopedCredential> = None;
        for role in chain {
            let next = self
                .assumer
                .assume_role(current.as_ref(), role, &self.config.session_name)
                .await
                .map_err(|e| AuthError::AssumeRoleFailed {
                    role_arn: role.arn(),
                    reason: e.to_string(),
                })?;
            debug!(role_arn = %role.arn(), "Assumed role");
            current = Some(next);
        }
        current.ok_or_else(|| AuthError::Untrusted {
            account_id: chain
                .last()
                .map(|r| r.account_id.clone())
                .unwrap_or_default(),
        })
    }
}
