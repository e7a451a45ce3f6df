//! VM lifecycle state types.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the supervised VM.
///
/// This is the supervisor's belief about the VM, not the guest's own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No VM process. Initial phase and the result of a clean shutdown.
    #[default]
    Stopped,

    /// Persistent state is being prepared, or is ready and awaiting start.
    Initializing,

    /// The VM process is being spawned.
    Starting,

    /// The VM process exists. Says nothing about guest boot progress.
    Running,

    /// The VM process is being shut down.
    Stopping,

    /// An unrecoverable failure happened. Cleared by the next start.
    Error,
}

impl Phase {
    /// Phases in which a lifecycle operation is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, Phase::Starting | Phase::Stopping)
    }

    /// Check if the VM is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Phase::Running)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;

        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Stopped | Error, Initializing)
                | (Initializing, Starting | Stopped)
                | (Starting, Running)
                | (Running, Stopping | Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Get the phase name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Stopped => "stopped",
            Phase::Initializing => "initializing",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Error => "error",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Phase::Stopped),
            "initializing" => Ok(Phase::Initializing),
            "starting" => Ok(Phase::Starting),
            "running" => Ok(Phase::Running),
            "stopping" => Ok(Phase::Stopping),
            "error" => Ok(Phase::Error),
            other => Err(format!("unknown phase: {}", other)),
        }
    }
}

/// How the VM process ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExitReason {
    /// Exited on its own with a code.
    Exited {
        /// Exit code from the process.
        code: i32,
    },

    /// Killed by signal.
    Signaled {
        /// Signal number.
        signal: i32,
    },

    /// The exit status could not be collected.
    Unknown {
        /// What went wrong while collecting it.
        details: String,
    },
}

impl ExitReason {
    /// Check if this represents a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitReason::Exited { code: 0 })
    }

    /// Create an exited reason with the given code.
    pub fn exited(code: i32) -> Self {
        Self::Exited { code }
    }

    /// Create a signaled reason with the given signal.
    pub fn signaled(signal: i32) -> Self {
        Self::Signaled { signal }
    }

    /// Create an unknown reason with details.
    pub fn unknown(details: impl Into<String>) -> Self {
        Self::Unknown {
            details: details.into(),
        }
    }

    /// Phase the supervisor settles in after an exit nobody asked for.
    pub fn settled_phase(&self) -> Phase {
        if self.is_success() {
            Phase::Stopped
        } else {
            Phase::Error
        }
    }
}

impl From<std::process::ExitStatus> for ExitReason {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitReason::exited(code),
            (None, Some(signal)) => ExitReason::signaled(signal),
            (None, None) => ExitReason::unknown(status.to_string()),
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited { code } => write!(f, "exited with code {}", code),
            ExitReason::Signaled { signal } => write!(f, "killed by signal {}", signal),
            ExitReason::Unknown { details } => write!(f, "exit status unknown: {}", details),
        }
    }
}
