//! Utilization collection across accounts and regions
//!
//! This module holds the upstream seams (resource directory and telemetry
//! API) plus the components built on them:
//! - `enumerator`: lists the database instances in scope for a target
//! - `limiter`: per account/region rate limiting and concurrency slots
//! - `fetcher`: pulls one node's CPU series and aggregates it into a record
//! - `orchestrator`: fans the above out over every target of a run

mod enumerator;
mod fetcher;
mod limiter;
mod orchestrator;

#[cfg(test)]
mod tests;

pub use enumerator::{EnumeratorConfig, NodeListing, ResourceEnumerator, DEFAULT_ENGINES};
pub use fetcher::{FetchConfig, FetchContext, FetchOutcome, TelemetryFetcher};
pub use limiter::{
    token_bucket_factory, LimiterFactory, LimiterRegistry, NoopLimiter, RateLimitConfig,
    RateLimiter, ScopeSlots, TokenBucketLimiter,
};
pub use orchestrator::{
    CollectionConfig, CollectionOrchestrator, CollectionReport, NodeFailure, RunSummary,
    TargetFailure,
};

use crate::credentials::ScopedCredential;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// One database instance as the resource directory describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub instance_class: String,
    pub engine: String,
    pub engine_version: String,
    /// Cluster this instance belongs to, if any
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub is_cluster_writer: bool,
    /// Set when the instance replicates from another instance
    #[serde(default)]
    pub read_replica_source: Option<String>,
}

/// A database cluster with its member instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescription {
    pub cluster_id: String,
    pub engine: String,
    pub members: Vec<InstanceDescription>,
}

/// One page of a directory listing; `marker` continues it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub marker: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            marker: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("directory throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("malformed directory response: {0}")]
    Malformed(String),
}

/// Lists database clusters and instances in one account/region
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// Clusters in the region, optionally only the named one.
    ///
    /// A filter naming an absent cluster yields `NotFound` or an empty page;
    /// the enumerator treats both the same way.
    async fn describe_clusters(
        &self,
        cred: &ScopedCredential,
        region: &str,
        cluster_filter: Option<&str>,
        marker: Option<&str>,
    ) -> Result<Page<ClusterDescription>, DirectoryError>;

    /// Instances in the region, optionally only the named one
    async fn describe_instances(
        &self,
        cred: &ScopedCredential,
        region: &str,
        instance_filter: Option<&str>,
        marker: Option<&str>,
    ) -> Result<Page<InstanceDescription>, DirectoryError>;
}

/// One request for a page of a metric series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub region: String,
    pub instance_id: String,
    pub metric_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_secs: i64,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPage {
    pub datapoints: Vec<Datapoint>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsApiError {
    #[error("telemetry api throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transient telemetry api failure: {0}")]
    Transient(String),

    #[error("malformed telemetry response: {0}")]
    Malformed(String),
}

/// Time-series telemetry API, one page per call
#[async_trait]
pub trait MetricsApi: Send + Sync {
    async fn get_metric_page(
        &self,
        cred: &ScopedCredential,
        query: &MetricQuery,
    ) -> Result<MetricPage, MetricsApiError>;
}
