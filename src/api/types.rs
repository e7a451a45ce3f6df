//! JSON request and response types for the API.

use serde::{Deserialize, Serialize};

use crate::vm::Phase;

/// Default number of lines returned by the logs endpoint.
pub const DEFAULT_LOG_LINES: usize = 100;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "ok" when the server answers.
    pub status: String,
    /// Server version.
    pub version: String,
}

/// Request to start the VM. Missing fields fall back to the configured defaults.
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    /// Memory in MiB.
    #[serde(default)]
    pub ram_mb: Option<u32>,
    /// Number of vCPUs.
    #[serde(default)]
    pub cpus: Option<u8>,
}

/// Result of a lifecycle action.
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    /// Phase after the action.
    pub phase: Phase,
}

/// Request to run a command in the VM.
#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    /// Command text.
    pub command: String,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Command output.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecResponse {
    /// Output of the command.
    pub output: String,
    /// Transport that carried the command ("qmp" or "ssh").
    pub transport: String,
}

/// Query parameters for the logs endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Number of trailing lines.
    #[serde(default)]
    pub lines: Option<usize>,
}

/// Captured output lines.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    /// Oldest first.
    pub lines: Vec<String>,
}

/// Query parameters for the events stream.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only events of this kind ("transition" or "log").
    #[serde(default)]
    pub kind: Option<String>,
}
