use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::routing::RoutingCache;

pub const LIVENESS_PATH: &str = "/healthz";
pub const READINESS_PATH: &str = "/readyz";

/// Liveness and readiness probes, answered locally and never forwarded.
pub fn routes<S>(cache: Arc<RoutingCache>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route(LIVENESS_PATH, get(liveness))
        .route(READINESS_PATH, get(readiness))
        .with_state(cache)
}

async fn liveness() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
    }))
}

async fn readiness(State(cache): State<Arc<RoutingCache>>) -> impl IntoResponse {
    let table = cache.snapshot();
    let ready = cache.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "routes": table.len(),
            "generation": table.generation(),
            "timestamp": chrono::Utc::now(),
        })),
    )
}
