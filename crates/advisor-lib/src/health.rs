//! Health tracking for the fleet collector
//!
//! Components report their state after each collection so the `/healthz`
//! and `/readyz` endpoints reflect how the last run went.

use crate::collector::CollectionReport;
use crate::error::{TargetError, WriteError};
use crate::sink::WriteResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but some targets or nodes failed
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }

    /// Healthy with no failures, unhealthy when nothing succeeded
    fn from_counts(what: &str, failed: usize, total: usize) -> Self {
        if failed == 0 {
            Self::healthy()
        } else if failed >= total {
            Self::unhealthy(format!("all {} {} failed", total, what))
        } else {
            Self::degraded(format!("{} of {} {} failed", failed, total, what))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const CREDENTIAL_BROKER: &str = "credential_broker";
    pub const ENUMERATOR: &str = "enumerator";
    pub const FETCHER: &str = "fetcher";
    pub const SINK: &str = "sink";

    pub const ALL: &[&str] = &[CREDENTIAL_BROKER, ENUMERATOR, FETCHER, SINK];
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn register_all(&self) {
        for name in components::ALL {
            self.register(name).await;
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        let mut r = self.ready.write().await;
        *r = ready;
    }

    /// Derive broker, enumerator and fetcher health from a finished run
    pub async fn record_collection(&self, report: &CollectionReport) {
        let targets = report.summary.targets_ok + report.summary.targets_failed;
        let auth_failures = report
            .target_failures
            .iter()
            .filter(|f| matches!(f.error, TargetError::Auth(_)))
            .count();
        let enum_failures = report
            .target_failures
            .iter()
            .filter(|f| matches!(f.error, TargetError::Enum(_)))
            .count();

        self.update(
            components::CREDENTIAL_BROKER,
            ComponentHealth::from_counts("targets", auth_failures, targets),
        )
        .await;

        // Targets that never got credentials are not the enumerator's fault
        self.update(
            components::ENUMERATOR,
            ComponentHealth::from_counts(
                "target listings",
                enum_failures,
                targets.saturating_sub(auth_failures),
            ),
        )
        .await;

        self.update(
            components::FETCHER,
            ComponentHealth::from_counts("nodes", report.summary.failed, report.summary.total_nodes()),
        )
        .await;
    }

    pub async fn record_sink_write(&self, result: &Result<WriteResult, WriteError>) {
        let health = match result {
            Ok(write) if write.conflicts.is_empty() => ComponentHealth::healthy(),
            Ok(write) => ComponentHealth::degraded(format!(
                "{} records conflicted with stored content",
                write.conflicts.len()
            )),
            Err(e) => ComponentHealth::unhealthy(e.to_string()),
        };
        self.update(components::SINK, health).await;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        if !ready {
            ReadinessResponse {
                ready: false,
                reason: Some("Collector not yet initialized".to_string()),
            }
        } else if health.status == ComponentStatus::Unhealthy {
            ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{RunSummary, TargetFailure};
    use crate::error::AuthError;
    use crate::models::{Target, TimeRange};
    use chrono::{Duration, Utc};

    fn report(summary: RunSummary, target_failures: Vec<TargetFailure>) -> CollectionReport {
        let now = Utc::now();
        CollectionReport {
            run_id: "run-1".to_string(),
            window: TimeRange::new(now - Duration::days(1), now).unwrap(),
            records: Vec::new(),
            node_failures: Vec::new(),
            target_failures,
            summary,
        }
    }

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_register_all_components() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        let health = registry.health().await;
        assert_eq!(health.components.len(), 4);
        assert_eq!(
            health.components[components::FETCHER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_partial_node_failures_degrade_fetcher() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        let summary = RunSummary {
            complete: 8,
            partial: 0,
            failed: 2,
            targets_ok: 1,
            targets_failed: 0,
            cancelled: false,
        };
        registry.record_collection(&report(summary, Vec::new())).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components[components::FETCHER].status,
            ComponentStatus::Degraded
        );
        assert_eq!(
            health.components[components::CREDENTIAL_BROKER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_all_targets_untrusted_is_unhealthy() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;

        let failure = TargetFailure {
            target: Target::new("999999999999", "us-east-1"),
            error: TargetError::Auth(AuthError::Untrusted {
                account_id: "999999999999".to_string(),
            }),
        };
        let summary = RunSummary {
            targets_failed: 1,
            ..RunSummary::default()
        };
        registry.record_collection(&report(summary, vec![failure])).await;

        let health = registry.health().await;
        assert_eq!(
            health.components[components::CREDENTIAL_BROKER].status,
            ComponentStatus::Unhealthy
        );
        assert_eq!(
            health.components[components::ENUMERATOR].status,
            ComponentStatus::Healthy
        );
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_sink_write_outcomes() {
        let registry = HealthRegistry::new();

        let conflicted: Result<WriteResult, WriteError> = Ok(WriteResult {
            written: 1,
            duplicates: 0,
            conflicts: vec!["cpu_utilization/a.json".to_string()],
        });
        registry.record_sink_write(&conflicted).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        let failed: Result<WriteResult, WriteError> = Err(WriteError::Unavailable {
            key: "k".to_string(),
            reason: "503".to_string(),
        });
        registry.record_sink_write(&failed).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_readiness_ready_when_set() {
        let registry = HealthRegistry::new();
        registry.register_all().await;
        registry.set_ready(true).await;

        assert!(registry.readiness().await.ready);
    }
}
