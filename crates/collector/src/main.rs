//! Fleet collector - one collection run across every configured target
//!
//! Resolves credentials through the central hub role, collects CPU
//! utilization for every database node in scope, persists one record per
//! node and optionally runs the capacity estimation pass over everything
//! stored so far.

use advisor_lib::{
    collector::{
        token_bucket_factory, CollectionConfig, CollectionOrchestrator, EnumeratorConfig,
        FetchConfig, RateLimitConfig, ResourceEnumerator, TelemetryFetcher,
    },
    credentials::{BrokerConfig, CredentialBroker, RoleRef, TrustGraph},
    estimator::{Estimator, ReferenceData},
    gateway::GatewayClient,
    health::HealthRegistry,
    observability::{CollectorMetrics, StructuredLogger},
    sink::{LocalObjectStore, RecordSink, SinkConfig},
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::CollectorConfig;

const COLLECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = CollectorConfig::load()?;
    info!(
        run_label = %config.run_label,
        targets = config.targets.len(),
        "Collector configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let metrics = CollectorMetrics::new();
    let logger = StructuredLogger::new(&config.run_label);
    logger.log_startup(COLLECTOR_VERSION, config.targets.len());

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state.clone()));

    let gateway = Arc::new(
        GatewayClient::new(&config.gateway_endpoint, config.gateway_timeout())
            .context("Failed to create telemetry gateway client")?,
    );
    let orchestrator = build_orchestrator(&config, gateway, metrics.clone(), logger.clone());
    let sink = RecordSink::new(
        Arc::new(LocalObjectStore::new(&config.sink_root)),
        SinkConfig {
            prefix: config.sink_prefix.clone(),
            retry: config.retry_policy(),
        },
        metrics.clone(),
        logger.clone(),
    );

    health_registry.set_ready(true).await;

    // Ctrl-C stops new fetches; in-flight nodes still come back as records
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_logger = logger.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_logger.log_shutdown("SIGINT received");
            signal_cancel.cancel();
        }
    });

    let window = config.window(Utc::now())?;
    let report = orchestrator.run(config.targets(), window, cancel).await;
    health_registry.record_collection(&report).await;
    app_state.record_run(&report).await;

    let persisted = sink.write_with_retry(&report.records).await;
    health_registry.record_sink_write(&persisted).await;
    let persisted = persisted.context("Failed to persist utilization records")?;
    info!(
        run_id = %report.run_id,
        written = persisted.written,
        duplicates = persisted.duplicates,
        conflicts = persisted.conflicts.len(),
        "Utilization records persisted"
    );

    if config.estimate {
        run_estimation(&config, &sink, metrics, logger.clone()).await?;
    }

    if report.summary.cancelled {
        warn!(run_id = %report.run_id, "Run was cancelled before every node was collected");
    }
    logger.log_shutdown("run complete");
    api_handle.abort();

    Ok(())
}

fn build_orchestrator(
    config: &CollectorConfig,
    gateway: Arc<GatewayClient>,
    metrics: CollectorMetrics,
    logger: StructuredLogger,
) -> CollectionOrchestrator {
    let central = RoleRef::new(&config.central_account_id, &config.central_role_name);
    let trust = TrustGraph::central_hub(
        central,
        config.targets.iter().map(|t| t.account_id.as_str()),
        &config.source_role_name,
    )
    .resolve();

    let broker = Arc::new(CredentialBroker::new(
        gateway.clone(),
        trust,
        BrokerConfig::default(),
    ));
    let enumerator = Arc::new(ResourceEnumerator::new(
        gateway.clone(),
        EnumeratorConfig {
            engines: config.engines.clone(),
            retry: config.retry_policy(),
        },
    ));
    let fetcher = Arc::new(TelemetryFetcher::new(
        gateway,
        FetchConfig {
            retry: config.retry_policy(),
            timeout: config.fetch_timeout(),
            ..FetchConfig::default()
        },
        metrics.clone(),
    ));
    let limiters = token_bucket_factory(RateLimitConfig {
        requests_per_second: config.requests_per_second,
        ..RateLimitConfig::default()
    });

    CollectionOrchestrator::new(
        broker,
        enumerator,
        fetcher,
        limiters,
        CollectionConfig {
            max_in_flight_per_scope: config.max_in_flight_per_scope,
            run_timeout: config.run_timeout(),
            ..CollectionConfig::default()
        },
        metrics,
        logger,
    )
}

/// Estimate every record the sink holds and write the estimates as JSON
async fn run_estimation(
    config: &CollectorConfig,
    sink: &RecordSink,
    metrics: CollectorMetrics,
    logger: StructuredLogger,
) -> Result<()> {
    let pricing_path = config
        .pricing_path
        .as_ref()
        .context("pricing_path is required for estimation")?;
    let reference = ReferenceData::load(pricing_path)
        .with_context(|| format!("Failed to load reference data from {}", pricing_path.display()))?;

    let records = sink
        .read_records(None)
        .await
        .context("Failed to read persisted records")?;

    let report = Estimator::new(reference, metrics, logger).estimate_all(&records);
    info!(
        records = records.len(),
        estimates = report.estimates.len(),
        skipped = report.skipped,
        superseded = report.superseded,
        failures = report.failures.len(),
        "Estimation pass finished"
    );

    if let Some(parent) = config.estimates_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create estimates directory")?;
    }
    let body = serde_json::to_vec_pretty(&report.estimates).context("Failed to encode estimates")?;
    tokio::fs::write(&config.estimates_path, body)
        .await
        .with_context(|| format!("Failed to write {}", config.estimates_path.display()))?;

    Ok(())
}
