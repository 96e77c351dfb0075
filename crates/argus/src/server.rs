//! HTTP ingress: the Alertmanager push endpoint, JSON status readers, and
//! the Kubernetes probe endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::alerts::AlertsVector;
use crate::leader::LeaderElection;
use crate::liveness::LivenessVector;
use crate::noc::NocHealth;
use crate::sources::{ApiV2Alert, K8sLayerSource, PrometheusSource};
use crate::timer::CentralTimer;
use crate::watchdog::Watchdog;

/// Readiness threshold: the tick loop must have stamped within this window.
const READY_MAX_TICK_AGE_SECONDS: i64 = 10;

/// Everything the handlers read.
pub struct AppState {
    pub timer: Arc<CentralTimer>,
    pub vector: Arc<AlertsVector>,
    pub watchdog: Arc<Watchdog>,
    pub prometheus: Arc<PrometheusSource>,
    pub k8s_layer: Arc<K8sLayerSource>,
    pub leader: Arc<LeaderElection>,
    pub noc_health: Arc<NocHealth>,
    pub liveness: Arc<LivenessVector>,
}

/// Build the ingress router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v2/alerts", post(ingest_alerts))
        .route("/api/alerts", get(list_alerts))
        .route("/api/watchdog", get(watchdog_status))
        .route("/api/k8s/health", get(k8s_health))
        .route("/api/health", get(service_health))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Alertmanager v2 push. Always 200 with an empty body; filtering and
/// validation happen downstream.
async fn ingest_alerts(
    State(state): State<Arc<AppState>>,
    Json(alerts): Json<Vec<ApiV2Alert>>,
) -> StatusCode {
    debug!(count = alerts.len(), "Received alert push");
    state.prometheus.ingest(alerts).await;
    StatusCode::OK
}

/// Priority-ordered vector snapshot.
async fn list_alerts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.vector.get_snapshot().await)
}

async fn watchdog_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.watchdog.snapshot().await)
}

/// Latest K8s layer probe cycle; `null` until the first cycle completes.
async fn k8s_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.k8s_layer.last_status().await)
}

/// Composite service status.
async fn service_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tick = state.timer.current_tick();
    Json(json!({
        "status": "ok",
        "tick": tick,
        "gracePeriodActive": state.timer.is_grace_period_active(),
        "timer": state.timer.counters(),
        "leadership": state.leader.status(),
        "nocCircuitBreaker": state.noc_health.status(),
        "livenessVector": {
            "isHealthy": state.liveness.is_healthy(tick),
            "totalCount": state.liveness.count(),
            "unhealthyDetails": state.liveness.unhealthy_callbacks(tick),
        },
        "alertsVector": state.vector.counters().await,
        "ingest": state.prometheus.counters(),
    }))
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

/// Ready while the tick loop is stamping; 503 once it goes quiet.
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let age = (chrono::Utc::now() - state.timer.heartbeat_timestamp()).num_seconds();
    if age < READY_MAX_TICK_AGE_SECONDS {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "tick loop stalled")
    }
}
