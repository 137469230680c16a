//! Fleet utilization collection and serverless capacity estimation
//!
//! This crate provides the core functionality for:
//! - Cross-account credential brokering over a trust graph
//! - Enumerating database nodes per account/region
//! - Rate-limited, retried collection of CPU utilization series
//! - Append-only persistence of utilization records
//! - Workload classification and capacity/cost estimation
//! - Health checks and observability

pub mod collector;
pub mod credentials;
pub mod error;
pub mod estimator;
pub mod gateway;
pub mod health;
pub mod models;
pub mod observability;
pub mod retry;
pub mod sink;
pub mod stats;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{CollectorMetrics, StructuredLogger};
