//! Pricing and instance reference data
//!
//! Supplied to the estimator from outside; nothing here is computed or
//! refreshed by the collector. The JSON layout is
//!
//! ```json
//! {
//!   "pricing":   { "us-east-1": { "acu_price_per_hour": 0.12,
//!                                 "instances": { "db.r6g.large": { "on_demand_per_hour": 0.26,
//!                                                                  "reserved_per_hour": 0.17 } } } },
//!   "instances": { "db.r6g.large": { "vcpu_count": 2 },
//!                  "db.custom.x":  { "vcpu_count": 8, "family_ratio": 3.0 } }
//! }
//! ```
//!
//! Reserved prices are the one-year, no-upfront hourly rate.

use crate::error::ReferenceDataError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Instance class of nodes already on the auto-scaling tier
pub const SERVERLESS_CLASS: &str = "db.serverless";

/// ACU per vCPU by class prefix, used when a class has no explicit ratio
const FAMILY_DEFAULTS: &[(&str, f64)] = &[
    (SERVERLESS_CLASS, 1.0),
    ("db.r", 4.0),
    ("db.x", 4.0),
    ("db.c", 1.0),
    ("db.m", 2.0),
    ("db.t", 2.0),
];

/// Default ACU-per-vCPU ratio for an instance class, by family prefix
pub fn default_family_ratio(instance_class: &str) -> Option<f64> {
    FAMILY_DEFAULTS
        .iter()
        .find(|(prefix, _)| instance_class.starts_with(prefix))
        .map(|(_, ratio)| *ratio)
}

/// Hourly price of a provisioned instance class in one region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstancePricing {
    pub on_demand_per_hour: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_per_hour: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionPricing {
    pub acu_price_per_hour: f64,
    /// Provisioned prices by instance class
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instances: BTreeMap<String, InstancePricing>,
}

impl RegionPricing {
    pub fn new(acu_price_per_hour: f64) -> Self {
        Self {
            acu_price_per_hour,
            instances: BTreeMap::new(),
        }
    }

    pub fn with_instance(
        mut self,
        instance_class: impl Into<String>,
        on_demand_per_hour: f64,
        reserved_per_hour: Option<f64>,
    ) -> Self {
        self.instances.insert(
            instance_class.into(),
            InstancePricing {
                on_demand_per_hour,
                reserved_per_hour,
            },
        );
        self
    }
}

/// Region -> ACU price
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    regions: BTreeMap<String, RegionPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(self, region: impl Into<String>, acu_price_per_hour: f64) -> Self {
        self.with_region_pricing(region, RegionPricing::new(acu_price_per_hour))
    }

    pub fn with_region_pricing(mut self, region: impl Into<String>, pricing: RegionPricing) -> Self {
        self.regions.insert(region.into(), pricing);
        self
    }

    pub fn acu_price_per_hour(&self, region: &str) -> Option<f64> {
        self.regions.get(region).map(|p| p.acu_price_per_hour)
    }

    /// Current provisioned price of a class, if the region lists it
    pub fn instance_pricing(&self, region: &str, instance_class: &str) -> Option<InstancePricing> {
        self.regions.get(region)?.instances.get(instance_class).copied()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub vcpu_count: u32,
    /// Overrides the family default when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_ratio: Option<f64>,
}

/// Instance class -> vCPU count and ACU-per-vCPU ratio
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceFamilyRatios {
    classes: BTreeMap<String, InstanceSpec>,
}

impl InstanceFamilyRatios {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(
        mut self,
        instance_class: impl Into<String>,
        vcpu_count: u32,
        family_ratio: Option<f64>,
    ) -> Self {
        self.classes.insert(
            instance_class.into(),
            InstanceSpec {
                vcpu_count,
                family_ratio,
            },
        );
        self
    }

    pub fn vcpu_count(&self, instance_class: &str) -> Option<u32> {
        self.classes.get(instance_class).map(|s| s.vcpu_count)
    }

    /// Explicit ratio if configured, otherwise the family default.
    /// `None` when the class itself is unknown.
    pub fn family_ratio(&self, instance_class: &str) -> Option<f64> {
        let spec = self.classes.get(instance_class)?;
        spec.family_ratio
            .or_else(|| default_family_ratio(instance_class))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Everything the estimator consumes besides the records themselves
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceData {
    #[serde(default)]
    pub pricing: PricingTable,
    #[serde(default)]
    pub instances: InstanceFamilyRatios,
}

impl ReferenceData {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReferenceDataError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ReferenceDataError> {
        let data: Self = serde_json::from_str(raw)?;
        data.validate()?;
        Ok(data)
    }

    fn validate(&self) -> Result<(), ReferenceDataError> {
        for (region, pricing) in &self.pricing.regions {
            if !pricing.acu_price_per_hour.is_finite() || pricing.acu_price_per_hour < 0.0 {
                return Err(ReferenceDataError::Invalid(format!(
                    "ACU price for {} must be a non-negative number",
                    region
                )));
            }
            for (class, price) in &pricing.instances {
                let valid = |p: f64| p.is_finite() && p >= 0.0;
                if !valid(price.on_demand_per_hour) || !price.reserved_per_hour.map_or(true, valid) {
                    return Err(ReferenceDataError::Invalid(format!(
                        "{} price in {} must be a non-negative number",
                        class, region
                    )));
                }
            }
        }
        for (class, spec) in &self.instances.classes {
            if spec.vcpu_count == 0 {
                return Err(ReferenceDataError::Invalid(format!(
                    "{} has zero vCPUs",
                    class
                )));
            }
            if let Some(ratio) = spec.family_ratio {
                if !ratio.is_finite() || ratio <= 0.0 {
                    return Err(ReferenceDataError::Invalid(format!(
                        "{} has a non-positive family ratio",
                        class
                    )));
                }
            }
        }
        Ok(())
    }
}
