//! HTTP request handlers.

pub mod events;
pub mod exec;
pub mod vm;

use axum::Json;

use crate::api::types::HealthResponse;

/// GET /health - Liveness of the API server itself.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}
