//! Telemetry fetching
//!
//! Pulls one node's CPU series page by page and folds it into a
//! [`UtilizationRecord`]. Failures never escape as errors: they end up as the
//! record's status plus a [`FetchError`] returned next to it.

use super::{MetricPage, MetricQuery, MetricsApi, MetricsApiError, RateLimiter};
use crate::credentials::ScopedCredential;
use crate::error::FetchError;
use crate::models::{
    ComputeNode, TimeRange, UtilizationRecord, UtilizationSample, CPU_UTILIZATION,
    DEFAULT_PERIOD_SECS,
};
use crate::observability::CollectorMetrics;
use crate::retry::{drive, Disposition, RetryPolicy};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub metric_name: String,
    pub period_secs: i64,
    pub retry: RetryPolicy,
    /// Overall budget for one node, independent of the retry budget
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            metric_name: CPU_UTILIZATION.to_string(),
            period_secs: DEFAULT_PERIOD_SECS,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Run-scoped inputs injected by the caller
#[derive(Clone)]
pub struct FetchContext {
    pub run_id: String,
    /// Limiter for the node's account/region
    pub limiter: Arc<dyn RateLimiter>,
    /// Hard stop; the earlier of this and `FetchConfig::timeout` applies
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub record: UtilizationRecord,
    /// Why collection stopped early, if it did
    pub error: Option<FetchError>,
}

pub struct TelemetryFetcher {
    api: Arc<dyn MetricsApi>,
    config: FetchConfig,
    metrics: CollectorMetrics,
}

impl TelemetryFetcher {
    pub fn new(api: Arc<dyn MetricsApi>, config: FetchConfig, metrics: CollectorMetrics) -> Self {
        Self {
            api,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch and aggregate one node's series over `window`
    pub async fn fetch(
        &self,
        cred: &ScopedCredential,
        node: &ComputeNode,
        window: &TimeRange,
        ctx: &FetchContext,
    ) -> FetchOutcome {
        let started = Instant::now();
        let budget_end = started + self.config.timeout;
        let deadline = ctx.deadline.map_or(budget_end, |d| d.min(budget_end));

        let mut samples: Vec<UtilizationSample> = Vec::new();
        let mut next_token: Option<String> = None;

        let error = loop {
            if cred.is_expired() {
                break Some(FetchError::CredentialExpired {
                    account_id: cred.account_id().to_string(),
                });
            }

            let query = MetricQuery {
                region: node.region.clone(),
                instance_id: node.instance_id.clone(),
                metric_name: self.config.metric_name.clone(),
                start: window.start,
                end: window.end,
                period_secs: self.config.period_secs,
                next_token: next_token.take(),
            };

            match tokio::time::timeout_at(deadline, self.fetch_page(cred, &query, ctx)).await {
                Err(_) => {
                    break Some(FetchError::Timeout {
                        elapsed: started.elapsed(),
                    })
                }
                Ok(Err(err)) => break Some(err),
                Ok(Ok(page)) => {
                    samples.extend(
                        page.datapoints
                            .into_iter()
                            .filter(|dp| window.contains(dp.timestamp))
                            .map(|dp| UtilizationSample {
                                node_id: node.instance_id.clone(),
                                timestamp: dp.timestamp,
                                metric_name: self.config.metric_name.clone(),
                                value: dp.value,
                            }),
                    );
                    match page.next_token {
                        Some(token) => next_token = Some(token),
                        None => break None,
                    }
                }
            }
        };

        // Pages may overlap or arrive unordered; aggregate in time order
        samples.sort_by_key(|s| s.timestamp);
        samples.dedup_by_key(|s| s.timestamp);

        let expected = window.expected_samples(self.config.period_secs);
        let record = UtilizationRecord::from_samples(
            &ctx.run_id,
            node,
            window,
            &samples,
            expected,
            Utc::now(),
        );
        let record = match &error {
            None => record,
            Some(err) if err.is_fatal_for_node() => record.into_failed(err.to_string()),
            Some(err) => record.with_failure(err.to_string()),
        };

        self.metrics
            .observe_fetch_latency(started.elapsed().as_secs_f64());
        self.metrics.inc_records(record.collection_status.as_str());
        if let Some(err) = &error {
            self.metrics.inc_node_failures(err.kind());
        }

        debug!(
            node_id = %node.instance_id,
            samples = record.sample_count,
            expected = expected,
            status = %record.collection_status,
            "Fetched utilization series"
        );

        FetchOutcome { record, error }
    }

    async fn fetch_page(
        &self,
        cred: &ScopedCredential,
        query: &MetricQuery,
        ctx: &FetchContext,
    ) -> Result<MetricPage, FetchError> {
        let limiter = ctx.limiter.as_ref();
        let api = self.api.as_ref();
        let metrics = &self.metrics;

        drive(
            &self.config.retry,
            |attempt| async move {
                if attempt > 1 {
                    metrics.inc_retries();
                }
                limiter.acquire().await;
                match api.get_metric_page(cred, query).await {
                    Ok(page) => {
                        limiter.on_success().await;
                        Ok(page)
                    }
                    Err(MetricsApiError::Throttled { retry_after }) => {
                        metrics.inc_throttled();
                        limiter.on_throttled(retry_after).await;
                        Err(MetricsApiError::Throttled { retry_after })
                    }
                    Err(err) => Err(err),
                }
            },
            classify,
        )
        .await
        .map_err(|exhausted| match exhausted.error {
            MetricsApiError::Throttled { .. } => FetchError::Throttled {
                attempts: exhausted.attempts,
            },
            MetricsApiError::PermissionDenied(reason) => FetchError::PermissionDenied { reason },
            MetricsApiError::Transient(reason) | MetricsApiError::Malformed(reason) => {
                FetchError::Upstream { reason }
            }
        })
    }
}

fn classify(err: &MetricsApiError) -> Disposition {
    match err {
        MetricsApiError::Throttled { retry_after } => Disposition::Retry { hint: *retry_after },
        MetricsApiError::Transient(_) => Disposition::Retry { hint: None },
        MetricsApiError::PermissionDenied(_) | MetricsApiError::Malformed(_) => {
            Disposition::Fatal
        }
    }
}
