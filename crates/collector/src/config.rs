//! Collector configuration
//!
//! Loaded from an optional TOML file (`ADVISOR_CONFIG`, default
//! `advisor.toml`) layered under `ADVISOR__*` environment variables.

use advisor_lib::credentials::DEFAULT_SOURCE_ROLE;
use advisor_lib::models::{is_valid_account_id, Target, TimeRange};
use advisor_lib::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "advisor.toml";

/// One collection target as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetConfig {
    pub account_id: String,
    pub region: String,
    /// `"all"` or absent means every cluster
    #[serde(default)]
    pub cluster_identifier: Option<String>,
}

impl TargetConfig {
    pub fn to_target(&self) -> Target {
        let target = Target::new(&self.account_id, &self.region);
        match &self.cluster_identifier {
            Some(cluster) => target.with_cluster(cluster),
            None => target,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Tags every log line so scheduled runs can be told apart
    pub run_label: String,

    /// Port for /healthz, /readyz and /metrics
    pub api_port: u16,

    pub gateway_endpoint: String,
    pub gateway_timeout_secs: u64,

    /// Account hosting the hub role every source account trusts
    pub central_account_id: String,
    pub central_role_name: String,
    pub source_role_name: String,

    pub targets: Vec<TargetConfig>,

    /// Length of the trailing window, in days
    pub sample_period_days: u32,

    pub sink_root: PathBuf,
    pub sink_prefix: String,

    pub max_in_flight_per_scope: usize,
    pub requests_per_second: f64,
    pub fetch_timeout_secs: u64,
    /// Wall-clock bound on the whole collection run; unbounded when absent
    pub run_timeout_secs: Option<u64>,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Run the estimation pass after persisting
    pub estimate: bool,
    pub pricing_path: Option<PathBuf>,
    pub estimates_path: PathBuf,

    pub engines: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            run_label: "fleet-collector".to_string(),
            api_port: 8080,
            gateway_endpoint: "http://telemetry-gateway:8443".to_string(),
            gateway_timeout_secs: 30,
            central_account_id: String::new(),
            central_role_name: DEFAULT_SOURCE_ROLE.to_string(),
            source_role_name: DEFAULT_SOURCE_ROLE.to_string(),
            targets: Vec::new(),
            sample_period_days: 30,
            sink_root: PathBuf::from("./data"),
            sink_prefix: "cpu_utilization".to_string(),
            max_in_flight_per_scope: 4,
            requests_per_second: 10.0,
            fetch_timeout_secs: 120,
            run_timeout_secs: None,
            retry_max_attempts: 5,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 20_000,
            estimate: false,
            pricing_path: None,
            estimates_path: PathBuf::from("./data/estimates.json"),
            engines: vec!["aurora-postgresql".to_string(), "postgres".to_string()],
        }
    }
}

impl CollectorConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("ADVISOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("ADVISOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("engines"),
            )
            .build()
            .context("Failed to read collector configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid collector configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_account_id(&self.central_account_id) {
            bail!(
                "central_account_id '{}' must be a 12 digit account id",
                self.central_account_id
            );
        }
        if self.targets.is_empty() {
            bail!("no collection targets configured");
        }
        for target in &self.targets {
            target
                .to_target()
                .validate()
                .map_err(|reason| anyhow::anyhow!("invalid target: {}", reason))?;
        }
        if self.sample_period_days == 0 {
            bail!("sample_period_days must be at least 1");
        }
        if self.max_in_flight_per_scope == 0 {
            bail!("max_in_flight_per_scope must be at least 1");
        }
        if !self.requests_per_second.is_finite() || self.requests_per_second < 0.0 {
            bail!("requests_per_second must be a non-negative number");
        }
        if self.fetch_timeout_secs == 0 {
            bail!("fetch_timeout_secs must be at least 1");
        }
        if self.gateway_timeout_secs == 0 {
            bail!("gateway_timeout_secs must be at least 1");
        }
        if self.run_timeout_secs == Some(0) {
            bail!("run_timeout_secs must be at least 1 when set");
        }
        if self.retry_max_attempts == 0 {
            bail!("retry_max_attempts must be at least 1");
        }
        if self.engines.is_empty() {
            bail!("at least one engine must be configured");
        }
        if self.estimate && self.pricing_path.is_none() {
            bail!("estimate is enabled but pricing_path is not set");
        }
        Ok(())
    }

    pub fn targets(&self) -> Vec<Target> {
        self.targets.iter().map(TargetConfig::to_target).collect()
    }

    pub fn window(&self, now: DateTime<Utc>) -> Result<TimeRange> {
        TimeRange::trailing_days(self.sample_period_days, now)
            .map_err(|reason| anyhow::anyhow!("invalid sample window: {}", reason))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .max_attempts(self.retry_max_attempts)
            .base_delay(Duration::from_millis(self.retry_base_delay_ms))
            .max_delay(Duration::from_millis(self.retry_max_delay_ms))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}
