//! Observability infrastructure for the fleet collector
//!
//! Provides:
//! - Prometheus metrics (fetch latency, throttling, record outcomes, sink writes)
//! - Structured JSON logging with tracing

use crate::collector::RunSummary;
use crate::models::TimeRange;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Latency buckets for one node's fetch, in seconds
const FETCH_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

static GLOBAL_METRICS: OnceLock<CollectorMetricsInner> = OnceLock::new();

struct CollectorMetricsInner {
    fetch_latency_seconds: Histogram,
    throttled_responses: IntCounter,
    fetch_retries: IntCounter,
    records_total: IntCounterVec,
    node_failures: IntCounterVec,
    target_failures: IntCounterVec,
    fetches_in_flight: IntGauge,
    sink_writes: IntCounter,
    sink_duplicates: IntCounter,
    sink_conflicts: IntCounter,
    estimates_generated: IntCounter,
}

impl CollectorMetricsInner {
    fn new() -> Self {
        Self {
            fetch_latency_seconds: register_histogram!(
                "fleet_collector_fetch_latency_seconds",
                "Time spent fetching one node's utilization series",
                FETCH_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register fetch_latency_seconds"),

            throttled_responses: register_int_counter!(
                "fleet_collector_throttled_responses_total",
                "Telemetry API responses that signalled throttling"
            )
            .expect("Failed to register throttled_responses"),

            fetch_retries: register_int_counter!(
                "fleet_collector_fetch_retries_total",
                "Telemetry API calls that were retries"
            )
            .expect("Failed to register fetch_retries"),

            records_total: register_int_counter_vec!(
                "fleet_collector_records_total",
                "Utilization records produced, by collection status",
                &["status"]
            )
            .expect("Failed to register records_total"),

            node_failures: register_int_counter_vec!(
                "fleet_collector_node_failures_total",
                "Nodes whose collection stopped early, by reason",
                &["kind"]
            )
            .expect("Failed to register node_failures"),

            target_failures: register_int_counter_vec!(
                "fleet_collector_target_failures_total",
                "Targets that could not be collected, by reason",
                &["kind"]
            )
            .expect("Failed to register target_failures"),

            fetches_in_flight: register_int_gauge!(
                "fleet_collector_fetches_in_flight",
                "Node fetches currently running"
            )
            .expect("Failed to register fetches_in_flight"),

            sink_writes: register_int_counter!(
                "fleet_collector_sink_writes_total",
                "Records newly persisted by the sink"
            )
            .expect("Failed to register sink_writes"),

            sink_duplicates: register_int_counter!(
                "fleet_collector_sink_duplicates_total",
                "Identical records the sink skipped"
            )
            .expect("Failed to register sink_duplicates"),

            sink_conflicts: register_int_counter!(
                "fleet_collector_sink_conflicts_total",
                "Records whose key already held different content"
            )
            .expect("Failed to register sink_conflicts"),

            estimates_generated: register_int_counter!(
                "fleet_collector_estimates_generated_total",
                "Capacity estimates computed"
            )
            .expect("Failed to register estimates_generated"),
        }
    }
}

/// Lightweight handle to the process-wide collector metrics.
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct CollectorMetrics {
    _private: (),
}

impl Default for CollectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(CollectorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &CollectorMetricsInner {
        GLOBAL_METRICS.get_or_init(CollectorMetricsInner::new)
    }

    pub fn observe_fetch_latency(&self, duration_secs: f64) {
        self.inner().fetch_latency_seconds.observe(duration_secs);
    }

    pub fn inc_throttled(&self) {
        self.inner().throttled_responses.inc();
    }

    pub fn inc_retries(&self) {
        self.inner().fetch_retries.inc();
    }

    pub fn inc_records(&self, status: &str) {
        self.inner().records_total.with_label_values(&[status]).inc();
    }

    pub fn inc_node_failures(&self, kind: &str) {
        self.inner().node_failures.with_label_values(&[kind]).inc();
    }

    pub fn inc_target_failures(&self, kind: &str) {
        self.inner().target_failures.with_label_values(&[kind]).inc();
    }

    pub fn inc_in_flight(&self) {
        self.inner().fetches_in_flight.inc();
    }

    pub fn dec_in_flight(&self) {
        self.inner().fetches_in_flight.dec();
    }

    /// Record the outcome of one sink write call
    pub fn record_sink_write(&self, written: usize, duplicates: usize, conflicts: usize) {
        let inner = self.inner();
        inner.sink_writes.inc_by(written as u64);
        inner.sink_duplicates.inc_by(duplicates as u64);
        inner.sink_conflicts.inc_by(conflicts as u64);
    }

    pub fn inc_estimates_generated(&self) {
        self.inner().estimates_generated.inc();
    }
}

/// Structured logger for collector events
///
/// Every line carries an `event` field and the collector's run label so
/// runs from different schedulers can be told apart.
#[derive(Clone)]
pub struct StructuredLogger {
    run_label: String,
}

impl StructuredLogger {
    pub fn new(run_label: impl Into<String>) -> Self {
        Self {
            run_label: run_label.into(),
        }
    }

    pub fn log_startup(&self, version: &str, targets: usize) {
        info!(
            event = "collector_started",
            run_label = %self.run_label,
            collector_version = %version,
            targets = targets,
            "Fleet collector started"
        );
    }

    pub fn log_run_started(&self, run_id: &str, targets: usize, window: &TimeRange) {
        info!(
            event = "run_started",
            run_label = %self.run_label,
            run_id = %run_id,
            targets = targets,
            window_start = %window.start,
            window_end = %window.end,
            "Collection run started"
        );
    }

    pub fn log_target_failed(&self, run_id: &str, target: &str, kind: &str, reason: &str) {
        warn!(
            event = "target_failed",
            run_label = %self.run_label,
            run_id = %run_id,
            collection_target = %target,
            kind = %kind,
            reason = %reason,
            "Target could not be collected"
        );
    }

    pub fn log_node_failed(&self, run_id: &str, node_id: &str, kind: &str, status: &str, reason: &str) {
        warn!(
            event = "node_failed",
            run_label = %self.run_label,
            run_id = %run_id,
            node_id = %node_id,
            kind = %kind,
            status = %status,
            reason = %reason,
            "Node collection stopped early"
        );
    }

    pub fn log_record_persisted(&self, key: &str, node_id: &str, duplicate: bool) {
        info!(
            event = "record_persisted",
            run_label = %self.run_label,
            key = %key,
            node_id = %node_id,
            duplicate = duplicate,
            "Utilization record persisted"
        );
    }

    pub fn log_run_summary(&self, run_id: &str, summary: &RunSummary) {
        if summary.failed > 0 || summary.targets_failed > 0 || summary.cancelled {
            warn!(
                event = "run_summary",
                run_label = %self.run_label,
                run_id = %run_id,
                complete = summary.complete,
                partial = summary.partial,
                failed = summary.failed,
                targets_ok = summary.targets_ok,
                targets_failed = summary.targets_failed,
                cancelled = summary.cancelled,
                "Collection run finished with failures: {}", summary
            );
        } else {
            info!(
                event = "run_summary",
                run_label = %self.run_label,
                run_id = %run_id,
                complete = summary.complete,
                partial = summary.partial,
                failed = summary.failed,
                targets_ok = summary.targets_ok,
                targets_failed = summary.targets_failed,
                cancelled = summary.cancelled,
                "Collection run finished: {}", summary
            );
        }
    }

    pub fn log_estimate(
        &self,
        node_id: &str,
        instance_class: &str,
        pattern_class: &str,
        estimated_acu: f64,
        hourly_cost: f64,
    ) {
        info!(
            event = "estimate_generated",
            run_label = %self.run_label,
            node_id = %node_id,
            instance_class = %instance_class,
            pattern_class = %pattern_class,
            estimated_acu = estimated_acu,
            hourly_cost = hourly_cost,
            "Capacity estimate generated"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "collector_shutdown",
            run_label = %self.run_label,
            reason = %reason,
            "Fleet collector shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_metrics_handles_share_registry() {
        let metrics = CollectorMetrics::new();
        let other = metrics.clone();

        metrics.observe_fetch_latency(0.2);
        metrics.inc_records("complete");
        other.inc_node_failures("throttled");
        other.record_sink_write(3, 1, 0);
        CollectorMetrics::new().inc_estimates_generated();
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("nightly");
        assert_eq!(logger.run_label, "nightly");
    }
}
