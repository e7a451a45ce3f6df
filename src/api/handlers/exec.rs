//! Command execution handler.

use axum::{extract::State, Json};
use std::sync::Arc;
use std::time::Duration;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{ExecRequest, ExecResponse};
use crate::control::MAX_COMMAND_TIMEOUT;

/// POST /api/v1/vm/exec - Run a command in the VM.
pub async fn exec_command(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command cannot be empty".into()));
    }

    let timeout = req
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(state.command_timeout);
    if timeout > MAX_COMMAND_TIMEOUT {
        return Err(ApiError::BadRequest(format!(
            "timeout_secs cannot exceed {}",
            MAX_COMMAND_TIMEOUT.as_secs()
        )));
    }

    let supervisor = state.supervisor.clone();
    let command = req.command;
    let response = tokio::task::spawn_blocking(move || {
        supervisor.send_command_with_timeout(&command, timeout)
    })
    .await??;

    Ok(Json(ExecResponse {
        output: response.output,
        transport: response.transport,
    }))
}
