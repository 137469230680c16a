//! Collection orchestrator
//!
//! One spawned task per target resolves credentials, pulls nodes from the
//! enumerator and spawns one fetch task per node. In-flight fetches are capped
//! per account/region through [`ScopeSlots`], and each scope shares one rate
//! limiter. Limiters and slots are created per run and dropped with it.
//!
//! Every enumerated node comes back as a record, including nodes that failed
//! or were never started because the run was cancelled.

use super::{
    FetchContext, FetchOutcome, LimiterFactory, LimiterRegistry, ResourceEnumerator, ScopeSlots,
    TelemetryFetcher,
};
use crate::credentials::CredentialBroker;
use crate::error::{EnumError, FetchError, TargetError};
use crate::models::{CollectionStatus, ComputeNode, Target, TimeRange, UtilizationRecord};
use crate::observability::{CollectorMetrics, StructuredLogger};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Simultaneous fetches allowed per account/region pair
    pub max_in_flight_per_scope: usize,
    /// Added to the fetcher's own timeout before a fetch task is abandoned
    pub timeout_grace: Duration,
    /// Bound on credential resolution and on each enumeration step
    pub setup_timeout: Duration,
    /// Wall-clock bound on the whole run; fetches still running at that
    /// point stop with whatever samples they have
    pub run_timeout: Option<Duration>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_scope: 4,
            timeout_grace: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(300),
            run_timeout: None,
        }
    }
}

/// Node-level failure reported next to the record it produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node_id: String,
    pub cluster_id: String,
    pub account_id: String,
    pub region: String,
    pub error: FetchError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub target: Target,
    pub error: TargetError,
}

/// Counts reported at the end of every run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
    pub targets_ok: usize,
    pub targets_failed: usize,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn tally(
        records: &[UtilizationRecord],
        targets_total: usize,
        target_failures: usize,
        cancelled: bool,
    ) -> Self {
        let mut summary = Self {
            targets_ok: targets_total.saturating_sub(target_failures),
            targets_failed: target_failures,
            cancelled,
            ..Self::default()
        };
        for record in records {
            match record.collection_status {
                CollectionStatus::Complete => summary.complete += 1,
                CollectionStatus::Partial => summary.partial += 1,
                CollectionStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn total_nodes(&self) -> usize {
        self.complete + self.partial + self.failed
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nodes: {} complete, {} partial, {} failed; targets: {} ok, {} failed",
            self.complete, self.partial, self.failed, self.targets_ok, self.targets_failed
        )?;
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CollectionReport {
    pub run_id: String,
    pub window: TimeRange,
    /// One record per enumerated node, failed ones included
    pub records: Vec<UtilizationRecord>,
    pub node_failures: Vec<NodeFailure>,
    pub target_failures: Vec<TargetFailure>,
    pub summary: RunSummary,
}

impl CollectionReport {
    /// Records with status `complete` or `partial`
    pub fn successful(&self) -> impl Iterator<Item = &UtilizationRecord> {
        self.records
            .iter()
            .filter(|r| r.collection_status != CollectionStatus::Failed)
    }
}

/// State shared by every task of one run
struct RunScope {
    run_id: String,
    window: TimeRange,
    limiters: LimiterRegistry,
    slots: ScopeSlots,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

struct TargetOutcome {
    outcomes: Vec<FetchOutcome>,
    error: Option<TargetError>,
}

impl TargetOutcome {
    fn failed(error: TargetError) -> Self {
        Self {
            outcomes: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Clone)]
pub struct CollectionOrchestrator {
    broker: Arc<CredentialBroker>,
    enumerator: Arc<ResourceEnumerator>,
    fetcher: Arc<TelemetryFetcher>,
    limiter_factory: LimiterFactory,
    config: CollectionConfig,
    metrics: CollectorMetrics,
    logger: StructuredLogger,
}

impl CollectionOrchestrator {
    pub fn new(
        broker: Arc<CredentialBroker>,
        enumerator: Arc<ResourceEnumerator>,
        fetcher: Arc<TelemetryFetcher>,
        limiter_factory: LimiterFactory,
        config: CollectionConfig,
        metrics: CollectorMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            broker,
            enumerator,
            fetcher,
            limiter_factory,
            config,
            metrics,
            logger,
        }
    }

    /// Collect every target over `window` under a fresh run id
    pub async fn run(
        &self,
        targets: Vec<Target>,
        window: TimeRange,
        cancel: CancellationToken,
    ) -> CollectionReport {
        let run_id = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        self.run_as(run_id, targets, window, cancel).await
    }

    pub async fn run_as(
        &self,
        run_id: String,
        targets: Vec<Target>,
        window: TimeRange,
        cancel: CancellationToken,
    ) -> CollectionReport {
        self.logger.log_run_started(&run_id, targets.len(), &window);

        let run = Arc::new(RunScope {
            run_id: run_id.clone(),
            window,
            limiters: LimiterRegistry::new(self.limiter_factory.clone()),
            slots: ScopeSlots::new(self.config.max_in_flight_per_scope),
            cancel: cancel.clone(),
            deadline: self
                .config
                .run_timeout
                .and_then(|timeout| Instant::now().checked_add(timeout)),
        });

        let targets_total = targets.len();
        let handles: Vec<(Target, JoinHandle<TargetOutcome>)> = targets
            .into_iter()
            .map(|target| {
                let this = self.clone();
                let run = run.clone();
                let task_target = target.clone();
                (
                    target,
                    tokio::spawn(async move { this.collect_target(&run, task_target).await }),
                )
            })
            .collect();

        let mut records = Vec::new();
        let mut node_failures = Vec::new();
        let mut target_failures = Vec::new();

        for (target, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| {
                TargetOutcome::failed(TargetError::Aborted(e.to_string()))
            });

            for FetchOutcome { record, error } in outcome.outcomes {
                if let Some(error) = error {
                    self.logger.log_node_failed(
                        &run_id,
                        &record.node_id,
                        error.kind(),
                        record.collection_status.as_str(),
                        &error.to_string(),
                    );
                    node_failures.push(NodeFailure {
                        node_id: record.node_id.clone(),
                        cluster_id: record.cluster_id.clone(),
                        account_id: record.account_id.clone(),
                        region: record.region.clone(),
                        error,
                    });
                }
                records.push(record);
            }

            if let Some(error) = outcome.error {
                self.metrics.inc_target_failures(error.kind());
                self.logger
                    .log_target_failed(&run_id, &target.to_string(), error.kind(), &error.to_string());
                target_failures.push(TargetFailure { target, error });
            }
        }

        let summary = RunSummary::tally(
            &records,
            targets_total,
            target_failures.len(),
            cancel.is_cancelled(),
        );
        self.logger.log_run_summary(&run_id, &summary);

        CollectionReport {
            run_id,
            window,
            records,
            node_failures,
            target_failures,
            summary,
        }
    }

    async fn collect_target(&self, run: &RunScope, target: Target) -> TargetOutcome {
        if run.cancel.is_cancelled() {
            return TargetOutcome::failed(TargetError::Cancelled);
        }

        let cred = match tokio::time::timeout(self.config.setup_timeout, self.broker.resolve(&target))
            .await
        {
            Ok(Ok(cred)) => cred,
            Ok(Err(err)) => return TargetOutcome::failed(err.into()),
            Err(_) => {
                return TargetOutcome::failed(TargetError::Aborted(format!(
                    "credential resolution exceeded {:?}",
                    self.config.setup_timeout
                )))
            }
        };

        let scope = target.scope();
        let limiter = run.limiters.for_scope(&scope);
        let semaphore = run.slots.semaphore(&scope);
        let mut listing = self.enumerator.list(cred.clone(), target.clone());

        let mut tasks: Vec<(ComputeNode, JoinHandle<FetchOutcome>)> = Vec::new();
        let mut not_started: Vec<ComputeNode> = Vec::new();
        let mut error: Option<TargetError> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => break,
                next = tokio::time::timeout(self.config.setup_timeout, listing.next()) => next,
            };
            let node = match next {
                Ok(None) => break,
                Ok(Some(Ok(node))) => node,
                Ok(Some(Err(err))) => {
                    error = Some(err.into());
                    break;
                }
                Err(_) => {
                    error = Some(
                        EnumError::Unreachable {
                            target: target.to_string(),
                            reason: "enumeration timed out".to_string(),
                        }
                        .into(),
                    );
                    break;
                }
            };

            // No new fetch starts once the run is cancelled
            let permit = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                not_started.push(node);
                break;
            };

            let this = self.clone();
            let cred = cred.clone();
            let task_node = node.clone();
            let window = run.window;
            let ctx = FetchContext {
                run_id: run.run_id.clone(),
                limiter: limiter.clone(),
                deadline: run.deadline,
            };
            let handle = tokio::spawn(async move {
                let _permit = permit;
                this.metrics.inc_in_flight();
                let backstop = this.fetcher.config().timeout + this.config.timeout_grace;
                let outcome = match tokio::time::timeout(
                    backstop,
                    this.fetcher.fetch(&cred, &task_node, &window, &ctx),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => failed_outcome(
                        &ctx.run_id,
                        &task_node,
                        &window,
                        FetchError::Timeout { elapsed: backstop },
                    ),
                };
                this.metrics.dec_in_flight();
                outcome
            });
            tasks.push((node, handle));
        }

        // Nodes from pages already listed still get a record
        if run.cancel.is_cancelled() {
            not_started.extend(listing.drain_buffered());
        }

        let mut outcomes = Vec::with_capacity(tasks.len() + not_started.len());
        for (node, handle) in tasks {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => failed_outcome(
                    &run.run_id,
                    &node,
                    &run.window,
                    FetchError::Upstream {
                        reason: format!("fetch task failed: {}", e),
                    },
                ),
            };
            outcomes.push(outcome);
        }

        if !not_started.is_empty() {
            info!(
                collection_target = %target,
                skipped = not_started.len(),
                "Run cancelled, not starting remaining fetches"
            );
        }
        for node in not_started {
            self.metrics.inc_records(CollectionStatus::Failed.as_str());
            self.metrics.inc_node_failures(FetchError::Cancelled.kind());
            outcomes.push(failed_outcome(
                &run.run_id,
                &node,
                &run.window,
                FetchError::Cancelled,
            ));
        }

        debug!(collection_target = %target, nodes = outcomes.len(), "Target collection finished");
        TargetOutcome { outcomes, error }
    }
}

fn failed_outcome(
    run_id: &str,
    node: &ComputeNode,
    window: &TimeRange,
    error: FetchError,
) -> FetchOutcome {
    FetchOutcome {
        record: UtilizationRecord::failed(run_id, node, window, error.to_string(), Utc::now()),
        error: Some(error),
    }
}
