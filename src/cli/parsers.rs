//! Shared CLI argument parsers.

use dockvm::control::TransportOrder;
use dockvm::vm::PortForward;
use std::time::Duration;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Parse a port forward (`[tcp|udp/]HOST:GUEST` or `PORT`).
pub fn parse_port(s: &str) -> Result<PortForward, String> {
    s.parse()
}

/// Parse a transport preference (`qmp-first`, `ssh-first`, `qmp`, `ssh`).
pub fn parse_transport(s: &str) -> Result<TransportOrder, String> {
    s.parse()
}
