//! API server state.

use crate::vm::{Resources, Supervisor};
use std::sync::Arc;
use std::time::Duration;

/// Shared API server state.
pub struct ApiState {
    /// The supervised VM.
    pub supervisor: Arc<Supervisor>,
    /// Resources used when a start request omits them.
    pub default_resources: Resources,
    /// Bound on exec requests that omit a timeout.
    pub command_timeout: Duration,
}

impl ApiState {
    /// Wrap a supervisor.
    pub fn new(supervisor: Arc<Supervisor>, default_resources: Resources, command_timeout: Duration) -> Self {
        Self {
            supervisor,
            default_resources,
            command_timeout,
        }
    }

    /// Resources for a start request, filling gaps from the defaults.
    pub fn resources_for(&self, ram_mb: Option<u32>, cpus: Option<u8>) -> Resources {
        Resources::new(
            ram_mb.unwrap_or(self.default_resources.ram_mb),
            cpus.unwrap_or(self.default_resources.cpus),
        )
    }
}
