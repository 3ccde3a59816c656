use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde_json::json;

use crate::services::metrics::get_metrics;
use crate::startup::AppState;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "subscription-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready when storage answers and the cache is reachable.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let storage = state.repos.catalog.ping().await;
    let cache = state.cache.health_check().await;

    if let Err(e) = &storage {
        tracing::warn!(error = %e, "Readiness: storage unavailable");
    }
    if let Err(e) = &cache {
        tracing::warn!(error = %e, "Readiness: cache unavailable");
    }

    let status = if storage.is_ok() && cache.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ready" } else { "not_ready" },
            "storage": storage.is_ok(),
            "cache": cache.is_ok(),
        })),
    )
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        get_metrics(),
    )
}
