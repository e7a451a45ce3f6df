//! Control channel to a running VM.
//!
//! A [`ControlChannel`] holds an ordered list of transports and offers one
//! `send` contract over all of them. The first transport that is reachable
//! answers; only [`Error::ChannelUnavailable`] moves on to the next one.
//! Any other failure (timeout, protocol error) belongs to the command and is
//! returned as is.
//!
//! Requests are not pipelined: `send` takes `&mut self`, so callers sharing a
//! channel serialize on whatever lock owns it.

pub mod qmp;
pub mod ssh;

pub use qmp::QmpTransport;
pub use ssh::{SshTarget, SshTransport};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Longest timeout a single command may ask for.
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Point in time `timeout` from now.
///
/// A timeout too large to represent is clamped to [`MAX_COMMAND_TIMEOUT`].
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + MAX_COMMAND_TIMEOUT)
}

/// One way of delivering a command to the VM.
pub trait ControlTransport: Send {
    /// Short name for logs and responses (e.g. "qmp").
    fn name(&self) -> &'static str;

    /// Deliver `command` and return its textual output.
    ///
    /// Must return within roughly `timeout`. An unreachable endpoint is
    /// reported as [`Error::ChannelUnavailable`].
    fn send(&mut self, command: &str, timeout: Duration) -> Result<String>;

    /// Release any connection. Idempotent.
    fn close(&mut self);
}

/// Output of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Command output, unescaped.
    pub output: String,
    /// Transport that served the request.
    pub transport: String,
}

/// Which transport is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportOrder {
    /// Control socket, then remote shell.
    #[default]
    QmpFirst,
    /// Remote shell, then control socket.
    SshFirst,
    /// Control socket only.
    QmpOnly,
    /// Remote shell only.
    SshOnly,
}

impl std::str::FromStr for TransportOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "qmp-first" | "auto" => Ok(TransportOrder::QmpFirst),
            "ssh-first" => Ok(TransportOrder::SshFirst),
            "qmp-only" | "qmp" => Ok(TransportOrder::QmpOnly),
            "ssh-only" | "ssh" => Ok(TransportOrder::SshOnly),
            other => Err(format!("unknown transport order: {}", other)),
        }
    }
}

/// Ordered set of transports behind one `send`.
pub struct ControlChannel {
    transports: Vec<Box<dyn ControlTransport>>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.transports.iter().map(|t| t.name()).collect();
        f.debug_struct("ControlChannel")
            .field("transports", &names)
            .finish()
    }
}

impl ControlChannel {
    /// Channel over the given transports, tried in order.
    pub fn new(transports: Vec<Box<dyn ControlTransport>>) -> Self {
        Self { transports }
    }

    /// Standard channel: QMP on `socket` and SSH to `target`, in `order`.
    pub fn standard(
        socket: impl Into<std::path::PathBuf>,
        target: SshTarget,
        order: TransportOrder,
    ) -> Self {
        let qmp = || Box::new(QmpTransport::new(socket.into())) as Box<dyn ControlTransport>;
        let ssh = || Box::new(SshTransport::new(target)) as Box<dyn ControlTransport>;

        let transports = match order {
            TransportOrder::QmpFirst => vec![qmp(), ssh()],
            TransportOrder::SshFirst => vec![ssh(), qmp()],
            TransportOrder::QmpOnly => vec![qmp()],
            TransportOrder::SshOnly => vec![ssh()],
        };
        Self::new(transports)
    }

    /// Transport names in preference order.
    pub fn transport_names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    /// Send one command. The first reachable transport wins.
    pub fn send(&mut self, command: &str, timeout: Duration) -> Result<ControlResponse> {
        let mut unreachable = Vec::new();

        for transport in self.transports.iter_mut() {
            match transport.send(command, timeout) {
                Ok(output) => {
                    tracing::debug!(transport = transport.name(), "command delivered");
                    return Ok(ControlResponse {
                        output,
                        transport: transport.name().to_string(),
                    });
                }
                Err(Error::ChannelUnavailable(reason)) => {
                    tracing::warn!(
                        transport = transport.name(),
                        reason = %reason,
                        "transport unavailable, trying next"
                    );
                    unreachable.push(format!("{}: {}", transport.name(), reason));
                }
                Err(e) => return Err(e),
            }
        }

        if unreachable.is_empty() {
            return Err(Error::channel_unavailable("no transports configured"));
        }
        Err(Error::channel_unavailable(unreachable.join("; ")))
    }

    /// Close every transport. Closing twice is a no-op.
    pub fn close(&mut self) {
        for transport in self.transports.iter_mut() {
            transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted transport.
    struct Fake {
        name: &'static str,
        reply: fn(&str) -> Result<String>,
        calls: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl ControlTransport for Fake {
        fn name(&self) -> &'static str {
            self.name
        }

        fn send(&mut self, command: &str, _timeout: Duration) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.reply)(command)
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake(
        name: &'static str,
        reply: fn(&str) -> Result<String>,
    ) -> (Box<dyn ControlTransport>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let transport = Fake {
            name,
            reply,
            calls: Arc::clone(&calls),
            closes: Arc::new(AtomicUsize::new(0)),
        };
        (Box::new(transport), calls)
    }

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn test_first_success_wins() {
        let (a, a_calls) = fake("a", |cmd| Ok(format!("a:{}", cmd)));
        let (b, b_calls) = fake("b", |_| Ok("b".into()));
        let mut channel = ControlChannel::new(vec![a, b]);

        let resp = channel.send("echo hi", T).unwrap();
        assert_eq!(resp.output, "a:echo hi");
        assert_eq!(resp.transport, "a");
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unavailable_falls_through() {
        let (a, _) = fake("a", |_| Err(Error::channel_unavailable("no socket")));
        let (b, _) = fake("b", |_| Ok("from b".into()));
        let mut channel = ControlChannel::new(vec![a, b]);

        let resp = channel.send("x", T).unwrap();
        assert_eq!(resp.transport, "b");
        assert_eq!(resp.output, "from b");
    }

    #[test]
    fn test_timeout_does_not_fall_through() {
        let (a, _) = fake("a", |_| {
            Err(Error::CommandTimeout {
                elapsed: Duration::from_secs(1),
            })
        });
        let (b, b_calls) = fake("b", |_| Ok("b".into()));
        let mut channel = ControlChannel::new(vec![a, b]);

        let err = channel.send("x", T).unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_all_unavailable_lists_reasons() {
        let (a, _) = fake("a", |_| Err(Error::channel_unavailable("no socket")));
        let (b, _) = fake("b", |_| Err(Error::channel_unavailable("refused")));
        let mut channel = ControlChannel::new(vec![a, b]);

        let err = channel.send("x", T).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, Error::ChannelUnavailable(_)));
        assert!(msg.contains("a: no socket"));
        assert!(msg.contains("b: refused"));
    }

    #[test]
    fn test_empty_channel_is_unavailable() {
        let mut channel = ControlChannel::new(Vec::new());
        assert!(matches!(
            channel.send("x", T),
            Err(Error::ChannelUnavailable(_))
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let transport = Fake {
            name: "a",
            reply: |_| Ok(String::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            closes: Arc::clone(&closes),
        };
        let mut channel = ControlChannel::new(vec![Box::new(transport)]);
        channel.close();
        channel.close();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_standard_order() {
        let target = SshTarget::default();
        let names = |order| {
            ControlChannel::standard("/tmp/q.sock", target.clone(), order).transport_names()
        };
        assert_eq!(names(TransportOrder::QmpFirst), vec!["qmp", "ssh"]);
        assert_eq!(names(TransportOrder::SshFirst), vec!["ssh", "qmp"]);
        assert_eq!(names(TransportOrder::QmpOnly), vec!["qmp"]);
        assert_eq!(names(TransportOrder::SshOnly), vec!["ssh"]);
    }

    #[test]
    fn test_deadline_saturates() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::from_secs(u64::MAX));
        assert!(deadline >= before + MAX_COMMAND_TIMEOUT);
        assert!(deadline <= Instant::now() + MAX_COMMAND_TIMEOUT);

        let short = deadline_after(Duration::from_millis(50));
        assert!(short <= Instant::now() + Duration::from_millis(50));
    }
}
