//! QMP transport over the VM's control socket.

use super::{deadline_after, ControlTransport};
use crate::error::{Error, Result};
use dockvm_protocol::{Command, Reply};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

struct Connection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

/// Sends monitor commands through QMP's `human-monitor-command`.
///
/// Connects lazily on the first `send` and performs the capabilities
/// handshake. The connection is kept for later commands and dropped after
/// any I/O failure or timeout, so a late reply can never be mistaken for
/// the answer to the next command.
pub struct QmpTransport {
    socket: PathBuf,
    conn: Option<Connection>,
}

impl QmpTransport {
    /// Transport for the socket at `socket`. Does not connect yet.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            conn: None,
        }
    }

    /// Socket path.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn connect(&self, deadline: Instant, timeout: Duration) -> Result<Connection> {
        let stream = UnixStream::connect(&self.socket).map_err(|e| {
            Error::channel_unavailable(format!("connect {}: {}", self.socket.display(), e))
        })?;
        stream.set_write_timeout(Some(timeout)).ok();
        let writer = stream.try_clone()?;
        let mut conn = Connection {
            reader: BufReader::new(stream),
            writer,
        };

        match read_reply(&mut conn, deadline, timeout)? {
            Reply::Greeting(_) => {}
            other => {
                return Err(Error::Protocol(format!(
                    "expected qmp greeting, got {:?}",
                    other
                )))
            }
        }

        write_command(&mut conn, &Command::capabilities())?;
        match read_reply(&mut conn, deadline, timeout)? {
            Reply::Return(_) => {}
            Reply::Error(body) => {
                return Err(Error::Protocol(format!(
                    "capabilities rejected: {}: {}",
                    body.class, body.desc
                )))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected capabilities reply: {:?}",
                    other
                )))
            }
        }

        tracing::debug!(socket = %self.socket.display(), "qmp connected");
        Ok(conn)
    }

    fn round_trip(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let deadline = deadline_after(timeout);

        if self.conn.is_none() {
            self.conn = Some(self.connect(deadline, timeout)?);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::channel_unavailable("not connected"));
        };

        write_command(conn, &Command::human_monitor(command))?;
        let reply = read_reply(conn, deadline, timeout)?;
        Ok(reply.into_output()?)
    }
}

impl ControlTransport for QmpTransport {
    fn name(&self) -> &'static str {
        "qmp"
    }

    fn send(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let result = self.round_trip(command, timeout);
        match &result {
            // The server answered; the stream is still in sync.
            Ok(_) | Err(Error::Protocol(_)) => {}
            Err(_) => self.close(),
        }
        result
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.writer.shutdown(std::net::Shutdown::Both);
            tracing::debug!(socket = %self.socket.display(), "qmp disconnected");
        }
    }
}

impl Drop for QmpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_command(conn: &mut Connection, command: &Command) -> Result<()> {
    let line = command.encode_line()?;
    conn.writer
        .write_all(line.as_bytes())
        .and_then(|_| conn.writer.flush())
        .map_err(|e| Error::channel_unavailable(format!("write failed: {}", e)))
}

/// Read lines until the first non-event reply or the deadline.
fn read_reply(conn: &mut Connection, deadline: Instant, timeout: Duration) -> Result<Reply> {
    let mut line = String::new();

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::CommandTimeout { elapsed: timeout });
        }
        conn.reader.get_ref().set_read_timeout(Some(deadline - now))?;

        line.clear();
        match conn.reader.read_line(&mut line) {
            Ok(0) => return Err(Error::channel_unavailable("connection closed by vm")),
            Ok(n) if n > dockvm_protocol::MAX_LINE_LEN => {
                return Err(dockvm_protocol::ProtocolError::LineTooLong(n).into())
            }
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(Error::CommandTimeout { elapsed: timeout });
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::channel_unavailable(format!("read failed: {}", e))),
        }

        let reply = Reply::parse(&line);
        if let Reply::Event { name, .. } = &reply {
            tracing::trace!(event = %name, "skipping qmp event");
            continue;
        }
        tracing::trace!(line = %line.trim_end(), "qmp reply");
        return Ok(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread::JoinHandle;

    const GREETING: &str =
        r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}}, "capabilities": []}}"#;

    /// Accept one client, do the handshake, then answer each command with
    /// the lines produced by `respond`.
    fn fake_qmp(
        socket: &Path,
        respond: impl Fn(&serde_json::Value) -> Vec<String> + Send + 'static,
    ) -> JoinHandle<Vec<String>> {
        let listener = UnixListener::bind(socket).unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut received = Vec::new();

            writeln!(writer, "{}", GREETING).unwrap();

            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                received.push(line.clone());
                let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                if request["execute"] == "qmp_capabilities" {
                    writeln!(writer, r#"{{"return": {{}}}}"#).unwrap();
                    continue;
                }
                for reply in respond(&request) {
                    writeln!(writer, "{}", reply).unwrap();
                }
            }
            received
        })
    }

    fn echo_reply(request: &serde_json::Value) -> Vec<String> {
        let cmd = request["arguments"]["command-line"].as_str().unwrap_or("");
        let output = cmd.strip_prefix("echo ").unwrap_or(cmd);
        vec![serde_json::json!({ "return": format!("{}\r\n", output) }).to_string()]
    }

    #[test]
    fn test_round_trip_unescapes_output() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.sock");
        let server = fake_qmp(&socket, echo_reply);

        let mut qmp = QmpTransport::new(&socket);
        assert!(!qmp.is_connected());

        let out = qmp
            .send("echo say \"hi\"\nthere", Duration::from_secs(5))
            .unwrap();
        assert_eq!(out, "say \"hi\"\nthere\r\n");
        assert!(qmp.is_connected());

        let out = qmp.send("echo again", Duration::from_secs(5)).unwrap();
        assert_eq!(out, "again\r\n");

        qmp.close();
        let received = server.join().unwrap();
        assert_eq!(received.len(), 3, "one handshake, two commands");
        assert!(received[1].contains(r#"say \"hi\"\nthere"#));
        assert!(received.iter().all(|l| l.matches('\n').count() == 1));
    }

    #[test]
    fn test_events_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.sock");
        let _server = fake_qmp(&socket, |_| {
            vec![
                r#"{"event": "RTC_CHANGE", "data": {"offset": 1}}"#.to_string(),
                r#"{"event": "NIC_RX_FILTER_CHANGED"}"#.to_string(),
                r#"{"return": "VM status: running\r\n"}"#.to_string(),
            ]
        });

        let mut qmp = QmpTransport::new(&socket);
        let out = qmp.send("info status", Duration::from_secs(5)).unwrap();
        assert_eq!(out, "VM status: running\r\n");
    }

    #[test]
    fn test_malformed_reply_returned_raw() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.sock");
        let _server = fake_qmp(&socket, |_| vec![r#"{"return": "cut of"#.to_string()]);

        let mut qmp = QmpTransport::new(&socket);
        let out = qmp.send("info version", Duration::from_secs(5)).unwrap();
        assert_eq!(out, r#"{"return": "cut of"#);
    }

    #[test]
    fn test_error_reply_keeps_connection() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.sock");
        let _server = fake_qmp(&socket, |request| {
            if request["arguments"]["command-line"] == "bad" {
                vec![r#"{"error": {"class": "GenericError", "desc": "nope"}}"#.to_string()]
            } else {
                echo_reply(request)
            }
        });

        let mut qmp = QmpTransport::new(&socket);
        let err = qmp.send("bad", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("nope"));
        assert!(qmp.is_connected());

        assert_eq!(qmp.send("echo ok", Duration::from_secs(5)).unwrap(), "ok\r\n");
    }

    #[test]
    fn test_missing_socket_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut qmp = QmpTransport::new(dir.path().join("absent.sock"));
        let err = qmp.send("info status", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable(_)));
        assert!(!qmp.is_connected());
    }

    #[test]
    fn test_oversized_timeout_does_not_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut absent = QmpTransport::new(dir.path().join("absent.sock"));
        let err = absent
            .send("info status", Duration::from_secs(u64::MAX))
            .unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable(_)));

        let socket = dir.path().join("qmp.sock");
        let _server = fake_qmp(&socket, echo_reply);
        let mut qmp = QmpTransport::new(&socket);
        let out = qmp.send("echo big", Duration::MAX).unwrap();
        assert_eq!(out, "big\r\n");
    }

    #[test]
    fn test_silent_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.sock");
        let _server = fake_qmp(&socket, |_| Vec::new());

        let mut qmp = QmpTransport::new(&socket);
        let started = Instant::now();
        let err = qmp
            .send("info status", Duration::from_millis(300))
            .unwrap_err();

        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!qmp.is_connected(), "dropped after timeout");
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut qmp = QmpTransport::new("/nonexistent/qmp.sock");
        qmp.close();
        qmp.close();
        assert!(!qmp.is_connected());
    }
}
