use axum::{extract::State, http::StatusCode, Json};

use crate::dtos::HealthResponse;
use crate::AppState;

/// Liveness plus dependency status. A down cache degrades but does not fail
/// the check; a down database does.
///
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (store_status, cache_status) =
        futures::future::join(state.store.health_check(), state.cache.health_check()).await;

    let database = match store_status {
        Ok(()) => "up",
        Err(e) => {
            tracing::error!(error = %e, "Database health check failed");
            "down"
        }
    };
    let cache = match cache_status {
        Ok(()) => "up",
        Err(e) => {
            tracing::warn!(error = %e, "Cache health check failed");
            "down"
        }
    };

    let (status_code, status) = match (database, cache) {
        ("up", "up") => (StatusCode::OK, "healthy"),
        ("up", _) => (StatusCode::OK, "degraded"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };

    (
        status_code,
        Json(HealthResponse {
            status,
            service: state.config.service_name.clone(),
            version: state.config.service_version.clone(),
            database,
            cache,
        }),
    )
}
