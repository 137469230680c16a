//! Core data models for fleet utilization collection

use crate::stats::UtilizationStats;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The single utilization signal ingested per compute node
pub const CPU_UTILIZATION: &str = "CPUUtilization";

/// Sample period requested from the telemetry API (one hour)
pub const DEFAULT_PERIOD_SECS: i64 = 3600;

/// Cluster filter value that means "every cluster in the target"
pub const ALL_CLUSTERS: &str = "all";

/// One collection scope: an account/region pair with an optional cluster filter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    account_id: String,
    region: String,
    cluster_filter: Option<String>,
}

impl Target {
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            cluster_filter: None,
        }
    }

    /// Restrict the target to one cluster. `"all"` leaves the target unfiltered.
    pub fn with_cluster(mut self, cluster_identifier: impl Into<String>) -> Self {
        let cluster = cluster_identifier.into();
        self.cluster_filter = if cluster.eq_ignore_ascii_case(ALL_CLUSTERS) || cluster.is_empty()
        {
            None
        } else {
            Some(cluster)
        };
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn cluster_filter(&self) -> Option<&str> {
        self.cluster_filter.as_deref()
    }

    /// The account/region pair this target is rate limited under
    pub fn scope(&self) -> ScopeKey {
        ScopeKey {
            account_id: self.account_id.clone(),
            region: self.region.clone(),
        }
    }

    /// Check account and region syntax
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_account_id(&self.account_id) {
            return Err(format!(
                "account id '{}' must be 12 digits",
                self.account_id
            ));
        }
        if !is_valid_region(&self.region) {
            return Err(format!("region '{}' is not a valid region name", self.region));
        }
        if let Some(cluster) = &self.cluster_filter {
            if cluster.chars().any(char::is_whitespace) {
                return Err(format!("cluster identifier '{}' contains whitespace", cluster));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cluster_filter {
            Some(cluster) => write!(f, "{}/{}/{}", self.account_id, self.region, cluster),
            None => write!(f, "{}/{}", self.account_id, self.region),
        }
    }
}

pub fn is_valid_account_id(account_id: &str) -> bool {
    account_id.len() == 12 && account_id.bytes().all(|b| b.is_ascii_digit())
}

/// Region names look like `us-east-1` or `us-gov-west-1`
pub fn is_valid_region(region: &str) -> bool {
    let parts: Vec<&str> = region.split('-').collect();
    if parts.len() < 3 {
        return false;
    }
    let (first, rest) = (parts[0], &parts[1..]);
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return false,
    };
    first.len() == 2
        && first.bytes().all(|b| b.is_ascii_lowercase())
        && middle
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_lowercase()))
        && !last.is_empty()
        && last.bytes().all(|b| b.is_ascii_digit())
}

/// Account/region pair used to key rate limiters and concurrency slots
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub account_id: String,
    pub region: String,
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.region)
    }
}

/// A database instance discovered by the enumerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub cluster_id: String,
    pub instance_id: String,
    pub account_id: String,
    pub region: String,
    pub instance_class: String,
    pub engine: String,
    pub engine_version: String,
    pub is_writer: bool,
}

impl ComputeNode {
    pub fn node_id(&self) -> &str {
        &self.instance_id
    }

    pub fn scope(&self) -> ScopeKey {
        ScopeKey {
            account_id: self.account_id.clone(),
            region: self.region.clone(),
        }
    }
}

/// Historical window samples are requested over. Half-open: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, String> {
        if end <= start {
            return Err(format!("window end {} is not after start {}", end, start));
        }
        Ok(Self { start, end })
    }

    /// Window of `days` ending at `now` truncated to the hour
    pub fn trailing_days(days: u32, now: DateTime<Utc>) -> Result<Self, String> {
        if days == 0 {
            return Err("sample period must be at least one day".to_string());
        }
        let secs = now.timestamp();
        let aligned = secs - secs.rem_euclid(DEFAULT_PERIOD_SECS);
        let end = DateTime::from_timestamp(aligned, 0)
            .ok_or_else(|| format!("timestamp {} out of range", aligned))?;
        Self::new(end - ChronoDuration::days(i64::from(days)), end)
    }

    pub fn duration(&self) -> ChronoDuration {
        self.end - self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Number of samples a complete series holds at the given period
    pub fn expected_samples(&self, period_secs: i64) -> u64 {
        if period_secs <= 0 {
            return 0;
        }
        (self.duration().num_seconds() / period_secs).max(0) as u64
    }
}

/// One raw utilization point returned by the telemetry API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
}

/// Persisted form of one sample inside a record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Complete,
    Partial,
    Failed,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::Complete => "complete",
            CollectionStatus::Partial => "partial",
            CollectionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity a record is deduplicated on in the sink
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordIdentity {
    pub node_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Aggregated utilization for one node over one window.
///
/// This is the unit of persistence. Field names and types are the schema the
/// query layer reads, so additions must stay backwards compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationRecord {
    pub run_id: String,
    pub node_id: String,
    pub cluster_id: String,
    pub account_id: String,
    pub region: String,
    pub instance_class: String,
    pub engine: String,
    pub engine_version: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub avg_cpu_pct: f64,
    pub p95_cpu_pct: f64,
    pub max_cpu_pct: f64,
    pub sample_count: u64,
    pub collection_status: CollectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub collected_at: DateTime<Utc>,
    #[serde(default)]
    pub cpu_series: Vec<SeriesPoint>,
}

impl UtilizationRecord {
    /// Build a record from a node's samples.
    ///
    /// `samples` must already be in chronological order. Status is `failed` for
    /// an empty set, `partial` below `expected` samples, `complete` otherwise.
    pub fn from_samples(
        run_id: &str,
        node: &ComputeNode,
        window: &TimeRange,
        samples: &[UtilizationSample],
        expected: u64,
        collected_at: DateTime<Utc>,
    ) -> Self {
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let stats = UtilizationStats::from_values(&values);
        let sample_count = values.len() as u64;

        let collection_status = if sample_count == 0 {
            CollectionStatus::Failed
        } else if sample_count < expected {
            CollectionStatus::Partial
        } else {
            CollectionStatus::Complete
        };

        Self {
            run_id: run_id.to_string(),
            node_id: node.instance_id.clone(),
            cluster_id: node.cluster_id.clone(),
            account_id: node.account_id.clone(),
            region: node.region.clone(),
            instance_class: node.instance_class.clone(),
            engine: node.engine.clone(),
            engine_version: node.engine_version.clone(),
            window_start: window.start,
            window_end: window.end,
            avg_cpu_pct: stats.avg,
            p95_cpu_pct: stats.p95,
            max_cpu_pct: stats.max,
            sample_count,
            collection_status,
            failure_reason: if sample_count == 0 {
                Some("no samples returned for window".to_string())
            } else {
                None
            },
            collected_at,
            cpu_series: samples
                .iter()
                .map(|s| SeriesPoint {
                    timestamp: s.timestamp,
                    value: s.value,
                })
                .collect(),
        }
    }

    /// A record for a node nothing could be collected for
    pub fn failed(
        run_id: &str,
        node: &ComputeNode,
        window: &TimeRange,
        reason: impl Into<String>,
        collected_at: DateTime<Utc>,
    ) -> Self {
        Self::from_samples(run_id, node, window, &[], 0, collected_at).with_failure(reason)
    }

    /// Attach the reason collection stopped early without changing the status
    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    /// Force the status to `failed`, keeping whatever samples were gathered
    pub fn into_failed(mut self, reason: impl Into<String>) -> Self {
        self.collection_status = CollectionStatus::Failed;
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn identity(&self) -> RecordIdentity {
        RecordIdentity {
            node_id: self.node_id.clone(),
            window_start: self.window_start,
            window_end: self.window_end,
        }
    }

    pub fn is_estimable(&self) -> bool {
        self.sample_count > 0 && self.collection_status != CollectionStatus::Failed
    }
}

/// Descriptive label for the shape of a node's utilization distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternClass {
    PeaksAndValleys,
    OutlierHeavy,
    Random,
    Consistent,
}

impl PatternClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternClass::PeaksAndValleys => "peaks_and_valleys",
            PatternClass::OutlierHeavy => "outlier_heavy",
            PatternClass::Random => "random",
            PatternClass::Consistent => "consistent",
        }
    }
}

impl fmt::Display for PatternClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
