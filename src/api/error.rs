//! API error types with HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::Error;

/// API error type with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request - invalid input (400).
    BadRequest(String),
    /// Conflict - operation not allowed in the current phase (409).
    Conflict(String),
    /// The VM could not be reached (503).
    Unavailable(String),
    /// The VM did not answer in time (504).
    Timeout(String),
    /// Internal server error (500).
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InvalidConfiguration(_) => ApiError::BadRequest(message),
            Error::Busy { .. }
            | Error::NotRunning { .. }
            | Error::NotInitialized
            | Error::InvalidState { .. } => ApiError::Conflict(message),
            Error::ChannelUnavailable(_) => ApiError::Unavailable(message),
            Error::CommandTimeout { .. } => ApiError::Timeout(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("task failed: {}", err))
    }
}
