//! Collector HTTP surface: health checks, Prometheus metrics and the last run summary

use advisor_lib::{
    collector::{CollectionReport, RunSummary},
    health::{ComponentStatus, HealthRegistry},
    models::TimeRange,
    observability::CollectorMetrics,
};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Counts kept from the most recent collection run
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub window: TimeRange,
    pub summary: RunSummary,
    pub records: usize,
    /// Node failures keyed by error kind
    pub node_failures: BTreeMap<&'static str, usize>,
    /// Target failures keyed by error kind
    pub target_failures: BTreeMap<&'static str, usize>,
    pub finished_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn from_report(report: &CollectionReport, finished_at: DateTime<Utc>) -> Self {
        let mut node_failures = BTreeMap::new();
        for failure in &report.node_failures {
            *node_failures.entry(failure.error.kind()).or_insert(0) += 1;
        }
        let mut target_failures = BTreeMap::new();
        for failure in &report.target_failures {
            *target_failures.entry(failure.error.kind()).or_insert(0) += 1;
        }

        Self {
            run_id: report.run_id.clone(),
            window: report.window,
            summary: report.summary.clone(),
            records: report.records.len(),
            node_failures,
            target_failures,
            finished_at,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: CollectorMetrics,
    last_run: Arc<RwLock<Option<RunSnapshot>>>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: CollectorMetrics) -> Self {
        Self {
            health_registry,
            metrics,
            last_run: Arc::new(RwLock::new(None)),
        }
    }

    /// Replace the snapshot served on `/summary`
    pub async fn record_run(&self, report: &CollectionReport) {
        let snapshot = RunSnapshot::from_report(report, Utc::now());
        *self.last_run.write().await = Some(snapshot);
    }

    pub async fn last_run(&self) -> Option<RunSnapshot> {
        self.last_run.read().await.clone()
    }
}

fn availability(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Degraded still answers 200 so partial node failures don't restart the collector
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health_registry.health().await;
    let status = availability(health.status != ComponentStatus::Unhealthy);
    (status, Json(health)).into_response()
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health_registry.readiness().await;
    (availability(readiness.ready), Json(readiness)).into_response()
}

/// 404 until the first run has finished
async fn summary(State(state): State<Arc<AppState>>) -> Response {
    match state.last_run().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_FOUND, "no collection run has finished yet").into_response(),
    }
}

async fn metrics() -> Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/summary", get(summary))
        .with_state(state)
}

/// Runs until the spawned task is aborted at the end of the collection
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Collector API listening");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
