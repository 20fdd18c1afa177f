//! uws-api: REST API for the UWS orchestrator.
//!
//! Read-only status views come straight from the `StatusStore`; the only
//! mutating route (manual reset) goes through the `ServiceRegistry`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/services` | Status of every service |
//! | GET | `/api/v1/services/{id}` | Status of one service |
//! | POST | `/api/v1/services/{id}/reset` | Clear a `failed_permanently` service |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/health` | Orchestrator's own health |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use uws_health::ServiceRegistry;
use uws_metrics::MetricsExporter;
use uws_state::StatusStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StatusStore,
    pub registry: Arc<ServiceRegistry>,
    pub metrics: Arc<MetricsExporter>,
}

/// Build the complete API router (REST + metrics + health).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/services", get(handlers::list_services))
        .route("/services/{id}", get(handlers::get_service))
        .route("/services/{id}/reset", post(handlers::reset_service));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/health", get(handlers::orchestrator_health))
        .with_state(state)
}
