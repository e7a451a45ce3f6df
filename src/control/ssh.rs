//! Remote-shell transport: runs commands in the guest over SSH.

use super::{deadline_after, ControlTransport};
use crate::error::{Error, Result};
use crate::vm::launcher::combined_pipe;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Exit status ssh uses for its own failures (connection refused, auth).
const SSH_FAILURE: i32 = 255;

const POLL: Duration = Duration::from_millis(20);

/// Where the guest's SSH server is reachable from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshTarget {
    /// Host name or address.
    pub host: String,
    /// Host-side port (forwarded to the guest's port 22).
    pub port: u16,
    /// Login user.
    pub user: String,
}

impl Default for SshTarget {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2222,
            user: "root".to_string(),
        }
    }
}

impl SshTarget {
    /// `user@host`.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Runs each command as a one-shot `ssh` invocation.
///
/// Host key checking is off (the guest is re-created freely) and
/// `BatchMode` keeps ssh from ever prompting.
#[derive(Debug, Clone)]
pub struct SshTransport {
    target: SshTarget,
    program: PathBuf,
}

impl SshTransport {
    /// Transport using the `ssh` found on `$PATH`.
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            program: PathBuf::from("ssh"),
        }
    }

    /// Use a different client binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments passed to the client for `command`.
    pub fn args(&self, command: &str, timeout: Duration) -> Vec<String> {
        let connect_timeout = timeout.as_secs().max(1);
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            format!("ConnectTimeout={}", connect_timeout),
            "-p".into(),
            self.target.port.to_string(),
            self.target.destination(),
            command.to_string(),
        ]
    }
}

impl ControlTransport for SshTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn send(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let (reader, writer) = combined_pipe()?;
        let writer_err = writer.try_clone()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(command, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err));

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::channel_unavailable(format!(
                "{} not found",
                self.program.display()
            )),
            _ => Error::channel_unavailable(format!("failed to run ssh: {}", e)),
        })?;
        drop(cmd);

        // Drain output concurrently so a chatty command cannot fill the pipe.
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = std::fs::File::from(reader).read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
        });

        let deadline = deadline_after(timeout);
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                tracing::debug!(command, "ssh command timed out");
                return Err(Error::CommandTimeout { elapsed: timeout });
            }
            std::thread::sleep(POLL);
        };

        // A forked helper (e.g. a ControlPersist master) can hold the pipe
        // open after ssh exits; the reader is then left detached.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let output = match rx.recv_timeout(remaining) {
            Ok(output) => output,
            Err(_) => {
                tracing::debug!(command, "ssh output still open at deadline");
                return Err(Error::CommandTimeout { elapsed: timeout });
            }
        };

        if status.code() == Some(SSH_FAILURE) {
            return Err(Error::channel_unavailable(format!(
                "ssh {}:{}: {}",
                self.target.host,
                self.target.port,
                output.trim()
            )));
        }

        Ok(output.trim().to_string())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_support::fake_vm;

    #[test]
    fn test_args_layout() {
        let ssh = SshTransport::new(SshTarget::default());
        let args = ssh.args("docker ps", Duration::from_secs(10));

        assert_eq!(
            &args[args.len() - 4..],
            &["-p", "2222", "root@localhost", "docker ps"]
        );
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
    }

    #[test]
    fn test_output_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        // Print the last argument (the remote command) and something on stderr.
        let client = fake_vm(
            dir.path(),
            "for last; do :; done\necho \"  ran: $last\"\necho warn >&2",
        );

        let mut ssh = SshTransport::new(SshTarget::default()).with_program(client);
        let out = ssh.send("uname -a", Duration::from_secs(5)).unwrap();
        assert_eq!(out, "ran: uname -a\nwarn");
    }

    #[test]
    fn test_nonzero_exit_still_returns_output() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_vm(dir.path(), "echo failed-cmd\nexit 1");

        let mut ssh = SshTransport::new(SshTarget::default()).with_program(client);
        assert_eq!(ssh.send("false", Duration::from_secs(5)).unwrap(), "failed-cmd");
    }

    #[test]
    fn test_connection_failure_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_vm(
            dir.path(),
            "echo 'ssh: connect to host localhost port 2222: Connection refused' >&2\nexit 255",
        );

        let mut ssh = SshTransport::new(SshTarget::default()).with_program(client);
        let err = ssh.send("true", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable(_)));
        assert!(err.to_string().contains("Connection refused"));
    }

    #[test]
    fn test_missing_client_is_unavailable() {
        let mut ssh = SshTransport::new(SshTarget::default())
            .with_program("/nonexistent/bin/ssh");
        assert!(matches!(
            ssh.send("true", Duration::from_secs(1)),
            Err(Error::ChannelUnavailable(_))
        ));
    }

    #[test]
    fn test_hung_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_vm(dir.path(), "exec sleep 30");

        let mut ssh = SshTransport::new(SshTarget::default()).with_program(client);
        let started = Instant::now();
        let err = ssh.send("sleep 30", Duration::from_millis(200)).unwrap_err();

        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_lingering_helper_does_not_outlive_timeout() {
        let dir = tempfile::tempdir().unwrap();
        // The backgrounded sleep keeps the output pipe open after exit.
        let client = fake_vm(dir.path(), "sleep 5 &\necho hi\nexit 0");

        let mut ssh = SshTransport::new(SshTarget::default()).with_program(client);
        let started = Instant::now();
        let err = ssh.send("true", Duration::from_millis(500)).unwrap_err();

        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
