//! Error types for dockvm.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using dockvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in dockvm operations.
#[derive(Error, Debug)]
pub enum Error {
    // Launch errors
    /// Configuration outside the accepted bounds. Rejected before spawn.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No VM binary at the expected location.
    #[error("vm executable not found: {}", path.display())]
    ExecutableMissing {
        /// Path (or program name) that was looked up.
        path: PathBuf,
    },

    /// The operating system refused to spawn the VM process.
    #[error("failed to spawn vm process: {0}")]
    SpawnFailed(String),

    // Lifecycle errors
    /// Another lifecycle operation is in flight.
    #[error("supervisor busy: vm is {phase}")]
    Busy {
        /// Phase at the time of the request.
        phase: String,
    },

    /// The operation requires a running VM.
    #[error("vm is not running (phase: {phase})")]
    NotRunning {
        /// Phase at the time of the request.
        phase: String,
    },

    /// `start` was requested before `initialize`.
    #[error("vm not initialized: call initialize first")]
    NotInitialized,

    /// VM is in an invalid state for the requested operation.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// The VM process died while it was supposed to be running.
    #[error("vm process exited unexpectedly: {0}")]
    UnexpectedExit(String),

    // Control channel errors
    /// No transport could reach the VM.
    #[error("control channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// No reply within the time bound.
    #[error("command timed out after {}ms", elapsed.as_millis())]
    CommandTimeout {
        /// Bound that was exceeded.
        elapsed: std::time::Duration,
    },

    /// The VM answered with an error or an unusable reply.
    #[error("control protocol error: {0}")]
    Protocol(String),

    // Storage errors
    /// Generic storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Boot media missing and no source configured to copy it from.
    #[error("boot media not found: {}", path.display())]
    BootMediaNotFound {
        /// Expected location of the boot media.
        path: PathBuf,
    },

    // Configuration errors
    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid configuration error with a message.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a spawn failure error with a message.
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    /// Create a channel unavailable error with a message.
    pub fn channel_unavailable(msg: impl Into<String>) -> Self {
        Self::ChannelUnavailable(msg.into())
    }

    /// Create a storage error with a message.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a busy error for the given phase.
    pub fn busy(phase: impl std::fmt::Display) -> Self {
        Self::Busy {
            phase: phase.to_string(),
        }
    }

    /// Create a not-running error for the given phase.
    pub fn not_running(phase: impl std::fmt::Display) -> Self {
        Self::NotRunning {
            phase: phase.to_string(),
        }
    }

    /// Whether the error means "try again later" rather than "this will never work".
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }

    /// Whether the caller may retry the same operation (possibly over another transport).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Busy { .. } | Error::ChannelUnavailable(_) | Error::CommandTimeout { .. }
        )
    }
}

impl From<dockvm_protocol::ProtocolError> for Error {
    fn from(err: dockvm_protocol::ProtocolError) -> Self {
        Error::Protocol(err.to_string())
    }
}
