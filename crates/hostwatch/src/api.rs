//! HTTP API for health checks, snapshots and Prometheus metrics
//!
//! A thin transport shell: handlers only call the engine's thread-safe
//! snapshot and stats operations, never its internal buffers.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use hostwatch_lib::{Engine, EngineState};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Shared application state
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Health check - 503 only when the engine has failed
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.stats();
    let status_code = match stats.state {
        EngineState::Error => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status_code, Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotParams {
    #[serde(default = "default_snapshot_samples")]
    samples: usize,
    #[serde(default = "default_snapshot_anomalies")]
    anomalies: usize,
}

fn default_snapshot_samples() -> usize {
    100
}

fn default_snapshot_anomalies() -> usize {
    20
}

/// Initial state for a newly connected client
async fn snapshot(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SnapshotParams>,
) -> impl IntoResponse {
    Json(state.engine.snapshot(params.samples, params.anomalies))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/snapshot", get(snapshot))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
