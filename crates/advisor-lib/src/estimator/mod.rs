//! Capacity and cost estimation
//!
//! Turns persisted utilization records into projections for running the
//! same workload on the auto-scaling tier:
//!
//! ```text
//! effective_vcpu = (p95_cpu_pct / 100) * vcpu_count(instance_class)
//! estimated_acu  = effective_vcpu * family_ratio(instance_class)
//! hourly_cost    = estimated_acu * acu_price_per_hour(region)
//! ```
//!
//! When the reference data prices the node's current instance class, the
//! estimate also carries the provisioned cost and the saving from moving
//! (negative when serverless would cost more).
//!
//! [`estimate`] is a pure function of its inputs. Estimates are never the
//! source of truth and can be recomputed from the sink at any time.

mod pattern;
mod reference;

pub use pattern::{analyze, classify, PatternAnalysis, PatternThresholds};
pub use reference::{
    default_family_ratio, InstanceFamilyRatios, InstancePricing, InstanceSpec, PricingTable,
    ReferenceData, RegionPricing, SERVERLESS_CLASS,
};

use crate::error::EstimateError;
use crate::models::{PatternClass, RecordIdentity, UtilizationRecord};
use crate::observability::{CollectorMetrics, StructuredLogger};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Largest capacity a single serverless node can scale to
pub const MAX_ACU: f64 = 256.0;

/// Granularity capacity is provisioned in
pub const ACU_STEP: f64 = 0.5;

pub const HOURS_PER_MONTH: f64 = 730.0;

/// Weights of P95 and max CPU in the adjusted estimate
const P95_WEIGHT: f64 = 0.95;
const MAX_WEIGHT: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPath {
    /// Aurora provisioned: switch the instance class in place
    InPlace,
    /// Non-Aurora engine: move platforms first
    Platform,
    /// Already serverless
    NoAction,
}

impl MigrationPath {
    pub fn for_node(engine: &str, instance_class: &str) -> Self {
        if instance_class == SERVERLESS_CLASS {
            MigrationPath::NoAction
        } else if engine.starts_with("aurora") {
            MigrationPath::InPlace
        } else {
            MigrationPath::Platform
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPath::InPlace => "in_place",
            MigrationPath::Platform => "platform",
            MigrationPath::NoAction => "no_action",
        }
    }
}

impl fmt::Display for MigrationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityEstimate {
    pub node_id: String,
    pub cluster_id: String,
    pub account_id: String,
    pub region: String,
    pub instance_class: String,
    pub engine: String,
    pub run_id: String,
    pub effective_vcpu: f64,
    pub estimated_acu: f64,
    pub hourly_cost_estimate: f64,
    pub pattern_class: PatternClass,
    pub pattern: PatternAnalysis,
    pub pattern_notes: String,
    /// Estimated ACU rounded up to the provisioning step
    pub provisioned_acu: f64,
    /// From CPU weighted towards P95 with a share of the peak
    pub adjusted_acu: f64,
    pub adjusted_hourly_cost: f64,
    pub monthly_cost_estimate: f64,
    /// Headroom relative to the current size before hitting [`MAX_ACU`]
    pub growth_capacity_factor: Option<f64>,
    pub migration_path: MigrationPath,
    /// On-demand price of the current instance
    pub provisioned_hourly_cost: Option<f64>,
    /// One-year reserved price of the current instance
    pub reserved_hourly_cost: Option<f64>,
    /// Provisioned on-demand minus serverless hourly cost
    pub hourly_savings: Option<f64>,
    pub monthly_savings: Option<f64>,
}

/// Estimate one record with the default pattern thresholds
pub fn estimate(
    record: &UtilizationRecord,
    pricing: &PricingTable,
    family: &InstanceFamilyRatios,
) -> Result<CapacityEstimate, EstimateError> {
    estimate_with(record, pricing, family, &PatternThresholds::default())
}

pub fn estimate_with(
    record: &UtilizationRecord,
    pricing: &PricingTable,
    family: &InstanceFamilyRatios,
    thresholds: &PatternThresholds,
) -> Result<CapacityEstimate, EstimateError> {
    if !record.is_estimable() {
        return Err(EstimateError::NoSamples {
            node_id: record.node_id.clone(),
        });
    }

    let pattern = analyze(&record.cpu_series, thresholds);
    let migration_path = MigrationPath::for_node(&record.engine, &record.instance_class);

    let mut estimate = CapacityEstimate {
        node_id: record.node_id.clone(),
        cluster_id: record.cluster_id.clone(),
        account_id: record.account_id.clone(),
        region: record.region.clone(),
        instance_class: record.instance_class.clone(),
        engine: record.engine.clone(),
        run_id: record.run_id.clone(),
        effective_vcpu: 0.0,
        estimated_acu: 0.0,
        hourly_cost_estimate: 0.0,
        pattern_class: pattern.class,
        pattern,
        pattern_notes: pattern.notes(thresholds),
        provisioned_acu: 0.0,
        adjusted_acu: 0.0,
        adjusted_hourly_cost: 0.0,
        monthly_cost_estimate: 0.0,
        growth_capacity_factor: None,
        migration_path,
        provisioned_hourly_cost: None,
        reserved_hourly_cost: None,
        hourly_savings: None,
        monthly_savings: None,
    };

    // Nodes already on the serverless tier have nothing to project
    if migration_path == MigrationPath::NoAction {
        return Ok(estimate);
    }

    let unknown_class = || EstimateError::UnknownInstanceClass {
        instance_class: record.instance_class.clone(),
    };
    let vcpu = f64::from(family.vcpu_count(&record.instance_class).ok_or_else(unknown_class)?);
    let ratio = family
        .family_ratio(&record.instance_class)
        .ok_or_else(unknown_class)?;
    let price = pricing
        .acu_price_per_hour(&record.region)
        .ok_or_else(|| EstimateError::UnknownRegion {
            region: record.region.clone(),
        })?;

    let effective_vcpu = record.p95_cpu_pct / 100.0 * vcpu;
    let estimated_acu = effective_vcpu * ratio;
    let hourly_cost = estimated_acu * price;

    let weighted_cpu = P95_WEIGHT * record.p95_cpu_pct + MAX_WEIGHT * record.max_cpu_pct;
    let adjusted_acu = round_up_to_step(weighted_cpu / 100.0 * vcpu * ratio);

    estimate.effective_vcpu = effective_vcpu;
    estimate.estimated_acu = estimated_acu;
    estimate.hourly_cost_estimate = hourly_cost;
    estimate.provisioned_acu = round_up_to_step(estimated_acu);
    estimate.adjusted_acu = adjusted_acu;
    estimate.adjusted_hourly_cost = adjusted_acu * price;
    estimate.monthly_cost_estimate = hourly_cost * HOURS_PER_MONTH;
    estimate.growth_capacity_factor = growth_capacity_factor(vcpu * ratio);

    if let Some(current) = pricing.instance_pricing(&record.region, &record.instance_class) {
        let savings = current.on_demand_per_hour - hourly_cost;
        estimate.provisioned_hourly_cost = Some(current.on_demand_per_hour);
        estimate.reserved_hourly_cost = current.reserved_per_hour;
        estimate.hourly_savings = Some(savings);
        estimate.monthly_savings = Some(savings * HOURS_PER_MONTH);
    }
    Ok(estimate)
}

/// Round up to the next [`ACU_STEP`], within `[ACU_STEP, MAX_ACU]`
fn round_up_to_step(acu: f64) -> f64 {
    ((acu / ACU_STEP).ceil() * ACU_STEP).clamp(ACU_STEP, MAX_ACU)
}

fn growth_capacity_factor(current_acu: f64) -> Option<f64> {
    if current_acu <= 0.0 {
        return None;
    }
    let factor = (MAX_ACU - current_acu) / current_acu;
    if factor <= 0.0 {
        return None;
    }
    Some((factor * 100.0).round() / 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimateFailure {
    pub node_id: String,
    pub error: EstimateError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstimationReport {
    pub estimates: Vec<CapacityEstimate>,
    /// Failed or empty records, never classified
    pub skipped: usize,
    /// Older copies of a node and window collected again by a later run
    pub superseded: usize,
    pub failures: Vec<EstimateFailure>,
}

/// One record per `{node_id, window_start, window_end}`, in first-seen order.
///
/// Re-runs over the same window append new copies to the sink. The latest
/// run's estimable copy wins; a window with no estimable copy keeps its
/// latest one.
pub fn latest_per_identity(records: &[UtilizationRecord]) -> Vec<&UtilizationRecord> {
    let rank = |r: &UtilizationRecord| (r.is_estimable(), r.run_id.clone(), r.collected_at);

    let mut slots: HashMap<RecordIdentity, usize> = HashMap::new();
    let mut latest: Vec<&UtilizationRecord> = Vec::new();
    for record in records {
        match slots.get(&record.identity()) {
            Some(&slot) => {
                if rank(record) > rank(latest[slot]) {
                    latest[slot] = record;
                }
            }
            None => {
                slots.insert(record.identity(), latest.len());
                latest.push(record);
            }
        }
    }
    latest
}

/// Batch estimation over everything the sink holds
pub struct Estimator {
    reference: ReferenceData,
    thresholds: PatternThresholds,
    metrics: CollectorMetrics,
    logger: StructuredLogger,
}

impl Estimator {
    pub fn new(reference: ReferenceData, metrics: CollectorMetrics, logger: StructuredLogger) -> Self {
        Self {
            reference,
            thresholds: PatternThresholds::default(),
            metrics,
            logger,
        }
    }

    pub fn with_thresholds(mut self, thresholds: PatternThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn estimate_all(&self, records: &[UtilizationRecord]) -> EstimationReport {
        let latest = latest_per_identity(records);
        let mut report = EstimationReport {
            superseded: records.len() - latest.len(),
            ..EstimationReport::default()
        };

        for record in latest {
            if !record.is_estimable() {
                debug!(node_id = %record.node_id, status = %record.collection_status, "Skipping record without usable samples");
                report.skipped += 1;
                continue;
            }

            match estimate_with(
                record,
                &self.reference.pricing,
                &self.reference.instances,
                &self.thresholds,
            ) {
                Ok(estimate) => {
                    self.metrics.inc_estimates_generated();
                    self.logger.log_estimate(
                        &estimate.node_id,
                        &estimate.instance_class,
                        estimate.pattern_class.as_str(),
                        estimate.estimated_acu,
                        estimate.hourly_cost_estimate,
                    );
                    report.estimates.push(estimate);
                }
                Err(error) => {
                    warn!(node_id = %record.node_id, error = %error, "Could not estimate node");
                    report.failures.push(EstimateFailure {
                        node_id: record.node_id.clone(),
                        error,
                    });
                }
            }
        }

        report
    }
}
