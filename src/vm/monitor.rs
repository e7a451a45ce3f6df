//! Liveness monitoring of the VM process.
//!
//! Liveness is polled: every interval the monitor asks the OS whether the
//! child has exited (`waitpid` with `WNOHANG`), so an external kill is
//! noticed within one interval. The monitor never touches supervisor state
//! itself. It reports the exit once through a callback and stops.

use super::launcher::VmProcess;
use super::state::ExitReason;
use crate::error::Result;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Non-blocking check: has the process not exited yet?
pub fn is_alive(process: &VmProcess) -> bool {
    matches!(process.try_exit(), Ok(None))
}

/// Handle to a running monitor thread.
#[derive(Debug)]
pub struct MonitorHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop polling and wait for the thread.
    ///
    /// Safe to call from inside the exit callback; the thread is then left
    /// to finish on its own.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the thread immediately.
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Periodic liveness poller for one process.
pub struct LivenessMonitor;

impl LivenessMonitor {
    /// Poll `process` every `interval` and call `on_exit` once if it exits.
    ///
    /// The callback is not called when the monitor is stopped first.
    pub fn spawn<F>(process: Arc<VmProcess>, interval: Duration, on_exit: F) -> Result<MonitorHandle>
    where
        F: FnOnce(ExitReason) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let pid = process.pid();

        let thread = std::thread::Builder::new()
            .name(format!("dockvm-liveness-{}", pid))
            .spawn(move || {
                tracing::debug!(pid, interval = ?interval, "liveness monitor started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Stop requested (or handle dropped).
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            tracing::debug!(pid, "liveness monitor stopped");
                            return;
                        }
                    }

                    let reason = match process.try_exit() {
                        Ok(None) => continue,
                        Ok(Some(reason)) => reason,
                        Err(e) => ExitReason::unknown(e.to_string()),
                    };

                    tracing::debug!(pid, %reason, "liveness check found process gone");
                    on_exit(reason);
                    return;
                }
            })?;

        Ok(MonitorHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::config::VmConfig;
    use crate::vm::events::EventNotifier;
    use crate::vm::launcher::{Launcher, OutputSink};
    use crate::vm::logs::LogBuffer;
    use crate::vm::test_support::fake_vm;
    use std::time::Instant;

    fn spawn_script(dir: &std::path::Path, body: &str) -> Arc<VmProcess> {
        let exe = fake_vm(dir, body);
        let config = VmConfig::builder(dir.join("disk"), dir.join("boot"))
            .control_socket(dir.join("qmp.sock"))
            .build();
        let sink = OutputSink::new(Arc::new(LogBuffer::default()), EventNotifier::new());
        Arc::new(Launcher::new(exe).launch(&config, sink).unwrap())
    }

    #[test]
    fn test_is_alive_tracks_process() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn_script(dir.path(), "exec sleep 30");
        assert!(is_alive(&process));

        process.kill().unwrap();
        assert!(!is_alive(&process));
    }

    #[test]
    fn test_external_kill_reported_within_interval() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn_script(dir.path(), "exec sleep 30");
        let (tx, rx) = mpsc::channel();

        let interval = Duration::from_millis(100);
        let _handle = LivenessMonitor::spawn(Arc::clone(&process), interval, move |reason| {
            tx.send(reason).unwrap();
        })
        .unwrap();

        // Simulate somebody else killing the VM.
        unsafe { libc::kill(process.pid() as libc::pid_t, libc::SIGKILL) };
        let killed_at = Instant::now();

        let reason = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reason, ExitReason::signaled(libc::SIGKILL));
        assert!(killed_at.elapsed() < interval * 3);

        // Exactly once
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_clean_exit_reported() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn_script(dir.path(), "sleep 0.1; exit 0");
        let (tx, rx) = mpsc::channel();

        let _handle =
            LivenessMonitor::spawn(process, Duration::from_millis(50), move |reason| {
                tx.send(reason).unwrap();
            })
            .unwrap();

        let reason = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(reason.is_success());
    }

    #[test]
    fn test_stopped_monitor_never_calls_back() {
        let dir = tempfile::tempdir().unwrap();
        let process = spawn_script(dir.path(), "exec sleep 30");
        let (tx, rx) = mpsc::channel::<ExitReason>();

        let handle = LivenessMonitor::spawn(
            Arc::clone(&process),
            Duration::from_secs(60),
            move |reason| {
                let _ = tx.send(reason);
            },
        )
        .unwrap();

        // Returns promptly despite the long interval.
        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(1));

        process.kill().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
