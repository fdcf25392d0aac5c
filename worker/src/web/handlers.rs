//! Health endpoint handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::health::{check_all, run_probe, HealthProbe, HealthStatus, NamedReport};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub probes: Arc<Vec<Arc<dyn HealthProbe>>>,
}

impl AppState {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        Self {
            probes: Arc::new(probes),
        }
    }
}

/// Build the health router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/:name", get(probe))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Aggregate health of every registered probe.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let summary = check_all(&state.probes).await;
    if summary.status != HealthStatus::Healthy {
        warn!(status = ?summary.status, "health_check_degraded");
    }
    (status_code(summary.status), Json(summary))
}

/// Health of a single probe by name.
pub async fn probe(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(probe) = state.probes.iter().find(|p| p.name() == name) else {
        info!(probe = %name, "health_probe_not_found");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "not_found", "probe": name })),
        )
            .into_response();
    };

    let report = run_probe(probe.as_ref()).await;
    let status = report.status;
    (
        status_code(status),
        Json(NamedReport {
            name: probe.name(),
            report,
        }),
    )
        .into_response()
}

fn status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy | HealthStatus::Unknown => StatusCode::SERVICE_UNAVAILABLE,
    }
}
