//! Health check handler.

use axum::Json;

use crate::api::types::HealthResponse;

/// GET /health - Health check.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::VERSION,
    })
}
