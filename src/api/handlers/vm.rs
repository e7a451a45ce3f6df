//! Lifecycle, status and log handlers.
//!
//! Supervisor calls block (process spawn, signal waits), so each one runs
//! on the blocking pool.

use axum::{
    extract::{Query, State},
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{ActionResponse, LogsQuery, LogsResponse, StartRequest, DEFAULT_LOG_LINES};
use crate::storage::InitReport;
use crate::vm::VmStatus;

/// GET /api/v1/vm - Current status.
pub async fn status(State(state): State<Arc<ApiState>>) -> Result<Json<VmStatus>, ApiError> {
    let supervisor = state.supervisor.clone();
    let status = tokio::task::spawn_blocking(move || supervisor.status()).await?;
    Ok(Json(status))
}

/// POST /api/v1/vm/initialize - Prepare disk and boot media.
pub async fn initialize(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<InitReport>, ApiError> {
    let supervisor = state.supervisor.clone();
    let report = tokio::task::spawn_blocking(move || supervisor.initialize()).await??;
    Ok(Json(report))
}

/// POST /api/v1/vm/start - Launch the VM.
///
/// The body is optional; missing values use the configured defaults.
pub async fn start(
    State(state): State<Arc<ApiState>>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<ActionResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let resources = state.resources_for(req.ram_mb, req.cpus);

    let supervisor = state.supervisor.clone();
    let phase = tokio::task::spawn_blocking(move || {
        supervisor.start(resources.ram_mb, resources.cpus)?;
        Ok::<_, crate::Error>(supervisor.phase())
    })
    .await??;
    Ok(Json(ActionResponse { phase }))
}

/// POST /api/v1/vm/stop - Shut the VM down.
pub async fn stop(State(state): State<Arc<ApiState>>) -> Result<Json<ActionResponse>, ApiError> {
    let supervisor = state.supervisor.clone();
    let phase = tokio::task::spawn_blocking(move || {
        supervisor.stop()?;
        Ok::<_, crate::Error>(supervisor.phase())
    })
    .await??;
    Ok(Json(ActionResponse { phase }))
}

/// POST /api/v1/vm/restart - Stop, settle, start again.
pub async fn restart(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ActionResponse>, ApiError> {
    let supervisor = state.supervisor.clone();
    let phase = tokio::task::spawn_blocking(move || {
        supervisor.restart()?;
        Ok::<_, crate::Error>(supervisor.phase())
    })
    .await??;
    Ok(Json(ActionResponse { phase }))
}

/// GET /api/v1/vm/logs - Last N captured lines.
///
/// Query parameters:
/// - `lines`: number of trailing lines (default 100)
pub async fn logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LogsQuery>,
) -> Json<LogsResponse> {
    let lines = state
        .supervisor
        .log_lines(query.lines.unwrap_or(DEFAULT_LOG_LINES));
    Json(LogsResponse { lines })
}
