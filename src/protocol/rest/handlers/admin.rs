//! Admin Handlers
//!
//! Health and liveness endpoints.

use std::sync::Arc;

use axum::{http::StatusCode, Extension, Json};

use crate::dispatch::SHUTTING_DOWN;
use crate::protocol::rest::dto::{ApiResponse, HealthDto, LivenessDto};
use crate::protocol::Gateway;

/// Health check endpoint
///
/// Answers 503 once the job queue is closed for shutdown.
pub async fn health(
    Extension(gateway): Extension<Arc<Gateway>>,
) -> (StatusCode, Json<ApiResponse<HealthDto>>) {
    if gateway.queue().is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error(SHUTTING_DOWN)),
        );
    }

    let health = HealthDto {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: gateway.uptime_seconds(),
        queue_len: gateway.queue().len(),
        active_connections: gateway.active_connections(),
        tracked_clients: gateway.tracked_clients(),
    };

    (StatusCode::OK, Json(ApiResponse::success(health)))
}

/// Liveness probe: answers as long as the runtime is serving requests.
pub async fn liveness() -> Json<LivenessDto> {
    Json(LivenessDto {
        status: "alive".to_string(),
    })
}
