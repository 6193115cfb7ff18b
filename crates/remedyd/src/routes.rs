//! API routes for remedyd

use crate::approval::ApprovalGateway;
use crate::change_feed::ChangeEvent;
use crate::health::{HealthReport, HealthStatus};
use crate::metrics::MetricsSnapshot;
use crate::server::AppState;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use remedy_common::event::ApprovalPayload;
use remedy_common::funnel::SuccessRateMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

type AppStateArc = Arc<AppState>;

const DEFAULT_FUNNEL_DAYS: i64 = 30;

// ============================================================================
// Health
// ============================================================================

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppStateArc>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.report().await;
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (code, Json(report))
}

// ============================================================================
// Metrics
// ============================================================================

pub fn metrics_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/metrics", get(metrics_text))
        .route("/v1/metrics", get(metrics_json))
        .route("/v1/metrics/funnel", get(funnel))
}

async fn metrics_text(State(state): State<AppStateArc>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_text(),
    )
}

async fn metrics_json(State(state): State<AppStateArc>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct FunnelQuery {
    pub days: Option<i64>,
}

async fn funnel(
    State(state): State<AppStateArc>,
    Query(query): Query<FunnelQuery>,
) -> Result<Json<SuccessRateMetrics>, (StatusCode, String)> {
    let days = query.days.unwrap_or(DEFAULT_FUNNEL_DAYS);
    if days <= 0 {
        return Err((StatusCode::BAD_REQUEST, "days must be positive".to_string()));
    }
    state.tracker.success_rate(days).await.map(Json).map_err(|e| {
        error!("[SERVER] Funnel query failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

// ============================================================================
// Change events
// ============================================================================

pub fn event_routes() -> Router<AppStateArc> {
    Router::new().route("/v1/events", post(push_event))
}

#[derive(Debug, Serialize)]
pub struct PushEventResponse {
    pub delivered: usize,
}

async fn push_event(
    State(state): State<AppStateArc>,
    Json(event): Json<ChangeEvent>,
) -> (StatusCode, Json<PushEventResponse>) {
    info!("[SERVER] {} pushed for {}", event.kind(), event.ticket_id());
    let delivered = state.hub.publish(event);
    (StatusCode::ACCEPTED, Json(PushEventResponse { delivered }))
}

// ============================================================================
// Approvals
// ============================================================================

pub fn approval_routes() -> Router<AppStateArc> {
    Router::new().route("/v1/approvals", post(decide_approval))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalDecisionRequest {
    pub ticket_id: String,
    pub request_id: Uuid,
    pub approved: bool,
    #[serde(default)]
    pub decided_by: Option<String>,
}

async fn decide_approval(
    State(state): State<AppStateArc>,
    Json(req): Json<ApprovalDecisionRequest>,
) -> Result<Json<ApprovalPayload>, (StatusCode, String)> {
    ApprovalGateway::decide(
        state.store.as_ref(),
        &req.ticket_id,
        req.request_id,
        req.approved,
        req.decided_by.as_deref(),
    )
    .await
    .map(Json)
    .map_err(|e| {
        let code = match e.code() {
            "config" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!("[SERVER] Approval decision rejected: {}", e);
        (code, e.to_string())
    })
}
