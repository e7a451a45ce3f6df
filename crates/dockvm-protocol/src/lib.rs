//! Wire format for the dockvm control socket.
//!
//! The supervised VM exposes a QEMU Machine Protocol (QMP) listener on a
//! Unix socket. The protocol is line oriented: every message in either
//! direction is a single JSON object terminated by `\n`.
//!
//! ```text
//! host                                  vm
//!  |  <-- {"QMP": {"version": ..}}       |   greeting on connect
//!  |  --> {"execute":"qmp_capabilities"} |
//!  |  <-- {"return": {}}                 |
//!  |  --> {"execute":"human-monitor-command","arguments":{"command-line":"info status"}}
//!  |  <-- {"event": "..."}               |   asynchronous, may interleave
//!  |  <-- {"return": "VM status: running\r\n"}
//! ```
//!
//! Requests and replies are correlated one-to-one: a client writes one
//! command line and then reads lines until the first non-event reply.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command that negotiates capabilities and leaves greeting mode.
pub const CAPABILITIES: &str = "qmp_capabilities";

/// Command that runs a human monitor (HMP) command line.
pub const HUMAN_MONITOR_COMMAND: &str = "human-monitor-command";

/// Maximum accepted reply line (1 MiB).
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Errors raised while encoding or decoding protocol lines.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The outgoing command could not be serialized.
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    /// The server answered a command with an error object.
    #[error("{class}: {desc}")]
    Command {
        /// QMP error class (e.g. `GenericError`).
        class: String,
        /// Human-readable description.
        desc: String,
    },

    /// The line exceeded [`MAX_LINE_LEN`].
    #[error("reply line too long: {0} bytes")]
    LineTooLong(usize),
}

/// An outgoing command.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    /// Command name.
    pub execute: String,
    /// Command arguments, omitted when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Command {
    /// Create a command without arguments.
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
        }
    }

    /// The capabilities negotiation command.
    pub fn capabilities() -> Self {
        Self::new(CAPABILITIES)
    }

    /// Run a monitor command line.
    pub fn human_monitor(command_line: &str) -> Self {
        Self {
            execute: HUMAN_MONITOR_COMMAND.to_string(),
            arguments: Some(serde_json::json!({ "command-line": command_line })),
        }
    }

    /// Encode the command as a single newline-terminated line.
    ///
    /// Quotes, backslashes and control characters inside string values are
    /// escaped, so the result always contains exactly one `\n`, at the end.
    pub fn encode_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// QMP error body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    /// Error class.
    pub class: String,
    /// Description.
    #[serde(default)]
    pub desc: String,
}

/// A decoded line received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Connection greeting.
    Greeting(Value),
    /// Successful command result.
    Return(Value),
    /// Failed command.
    Error(ErrorBody),
    /// Asynchronous event, not correlated with any command.
    Event {
        /// Event name.
        name: String,
        /// Event payload, if any.
        data: Option<Value>,
    },
    /// Anything that is not a well-formed QMP object.
    Malformed(String),
}

impl Reply {
    /// Decode one line. Never fails: unknown shapes become [`Reply::Malformed`].
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::trace!(error = %e, "unparseable qmp line");
                return Reply::Malformed(trimmed.to_string());
            }
        };

        let Value::Object(mut map) = value else {
            return Reply::Malformed(trimmed.to_string());
        };

        if let Some(ret) = map.remove("return") {
            return Reply::Return(ret);
        }
        if let Some(err) = map.remove("error") {
            return match serde_json::from_value::<ErrorBody>(err) {
                Ok(body) => Reply::Error(body),
                Err(_) => Reply::Malformed(trimmed.to_string()),
            };
        }
        if let Some(Value::String(name)) = map.remove("event") {
            return Reply::Event {
                name,
                data: map.remove("data"),
            };
        }
        if let Some(greeting) = map.remove("QMP") {
            return Reply::Greeting(greeting);
        }

        Reply::Malformed(trimmed.to_string())
    }

    /// Textual output of a reply.
    ///
    /// - a string `return` value is returned verbatim (JSON escapes such as
    ///   `\n`, `\r` and `\"` already decoded);
    /// - any other `return` value is rendered as compact JSON;
    /// - malformed lines are returned raw, unparsed;
    /// - error replies become [`ProtocolError::Command`].
    pub fn into_output(self) -> Result<String, ProtocolError> {
        match self {
            Reply::Return(Value::String(s)) => Ok(s),
            Reply::Return(other) => Ok(other.to_string()),
            Reply::Error(body) => Err(ProtocolError::Command {
                class: body.class,
                desc: body.desc,
            }),
            Reply::Malformed(raw) => Ok(raw),
            Reply::Greeting(v) => Ok(v.to_string()),
            Reply::Event { name, .. } => Ok(name),
        }
    }
}

/// Extract the output text from a raw reply line, falling back to the raw
/// line when the reply is malformed or partial.
pub fn extract_output(line: &str) -> Result<String, ProtocolError> {
    if line.len() > MAX_LINE_LEN {
        return Err(ProtocolError::LineTooLong(line.len()));
    }
    Reply::parse(line).into_output()
}
