//! REST API handlers.
//!
//! Status reads go to the `StatusStore`, so they never wait on a service
//! lock held by the control loop.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{info, warn};

use uws_health::HealthError;
use uws_state::ServiceState;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Services ───────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.snapshot() {
        Ok(snapshot) => ApiResponse::ok(snapshot).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/services/{id}
pub async fn get_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get(&id) {
        Ok(Some(status)) => ApiResponse::ok(status).into_response(),
        Ok(None) => error_response("service not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/services/{id}/reset
pub async fn reset_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.reset(&id).await {
        Ok(()) => {
            info!(service_id = %id, "reset requested via API");
            match state.store.get(&id) {
                Ok(Some(status)) => ApiResponse::ok(status).into_response(),
                Ok(None) => error_response("service not found", StatusCode::NOT_FOUND).into_response(),
                Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
            }
        }
        Err(HealthError::UnknownService(_)) => {
            error_response("service not found", StatusCode::NOT_FOUND).into_response()
        }
        Err(e @ HealthError::NotFailedPermanently(_)) => {
            error_response(&e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(e) => {
            warn!(service_id = %id, error = %e, "reset failed");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = uws_metrics::render_prometheus(&state.metrics.snapshot());
    (
        StatusCode::OK,
        [("content-type", uws_metrics::CONTENT_TYPE)],
        body,
    )
}

// ── Orchestrator health ────────────────────────────────────────

/// GET /health
///
/// Same contract the monitored services follow: `200` with a `healthy`
/// body, or `503` with a `detail` message.
pub async fn orchestrator_health(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.snapshot() {
        Ok(snapshot) => {
            let failed = snapshot
                .values()
                .filter(|s| s.state == ServiceState::FailedPermanently)
                .count();
            Json(serde_json::json!({
                "status": "healthy",
                "service": "uwsd",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "checks": {
                    "services": snapshot.len(),
                    "failed_permanently": failed,
                }
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "detail": format!("Service unhealthy: {e}") })),
        )
            .into_response(),
    }
}
