//! VM process launcher.
//!
//! Builds the QEMU command line from a [`VmConfig`] and spawns it with
//! stdout and stderr joined into one pipe. A reader thread drains the pipe
//! into the log buffer and the event notifier.

use super::config::VmConfig;
use super::events::{EventNotifier, LifecycleEvent};
use super::logs::LogBuffer;
use super::state::ExitReason;
use crate::control::deadline_after;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Program name looked up on `$PATH`.
pub const QEMU_PROGRAM: &str = "qemu-system-x86_64";

/// Install locations checked when `$PATH` has no match.
const CONVENTIONAL_PATHS: &[&str] = &[
    "/usr/bin/qemu-system-x86_64",
    "/usr/local/bin/qemu-system-x86_64",
    "/opt/homebrew/bin/qemu-system-x86_64",
    "/opt/local/bin/qemu-system-x86_64",
    "/usr/libexec/qemu-kvm",
];

/// Network device id shared by `-netdev` and `-device`.
const NETDEV_ID: &str = "net0";

/// Find the VM executable.
///
/// An explicit path wins and must exist. Otherwise `$PATH` is searched for
/// [`QEMU_PROGRAM`], then a few conventional install locations.
pub fn resolve_executable(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return if is_executable(path) {
            Ok(path.to_path_buf())
        } else {
            Err(Error::ExecutableMissing {
                path: path.to_path_buf(),
            })
        };
    }

    if let Some(found) = find_in_path(QEMU_PROGRAM) {
        return Ok(found);
    }

    CONVENTIONAL_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| is_executable(p))
        .ok_or_else(|| Error::ExecutableMissing {
            path: PathBuf::from(QEMU_PROGRAM),
        })
}

/// Search `$PATH` for an executable file named `program`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Escape a value for a QEMU `-opt key=value,...` list (commas are doubled).
fn qemu_opt(value: &Path) -> String {
    value.display().to_string().replace(',', ",,")
}

/// Build the argument vector for `config`.
///
/// The output is a pure function of the configuration: same input, same
/// arguments in the same order.
pub fn build_args(config: &VmConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(24);
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    push("-machine", "q35,accel=tcg".into());
    push("-cpu", "max".into());
    push("-smp", config.resources.cpus.to_string());
    push("-m", config.resources.ram_mb.to_string());
    push("-display", "none".into());
    push("-serial", "stdio".into());

    push(
        "-drive",
        format!(
            "file={},if=virtio,format={}",
            qemu_opt(&config.disk),
            config.disk_format.as_str()
        ),
    );
    push(
        "-drive",
        format!(
            "file={},media=cdrom,readonly=on",
            qemu_opt(&config.boot_media)
        ),
    );

    let mut netdev = format!("user,id={}", NETDEV_ID);
    for fwd in &config.port_forwards {
        netdev.push_str(",hostfwd=");
        netdev.push_str(&fwd.to_hostfwd());
    }
    push("-netdev", netdev);
    push("-device", format!("virtio-net-pci,netdev={}", NETDEV_ID));

    push(
        "-qmp",
        format!("unix:{},server,nowait", qemu_opt(&config.control_socket)),
    );

    args
}

/// Where captured output goes.
#[derive(Debug, Clone)]
pub struct OutputSink {
    logs: Arc<LogBuffer>,
    events: EventNotifier,
}

impl OutputSink {
    /// Store lines in `logs` and publish each one on `events`.
    pub fn new(logs: Arc<LogBuffer>, events: EventNotifier) -> Self {
        Self { logs, events }
    }

    fn line(&self, line: String) {
        tracing::trace!(target: "dockvm::vm::output", "{}", line);
        self.logs.append(line.clone());
        self.events.publish(LifecycleEvent::log(line));
    }
}

/// Spawns VM processes.
#[derive(Debug, Clone)]
pub struct Launcher {
    executable: PathBuf,
}

impl Launcher {
    /// Launcher for a known executable.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Launcher for the resolved QEMU binary. See [`resolve_executable`].
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        resolve_executable(explicit).map(Self::new)
    }

    /// Executable this launcher runs.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Full command line (program first) for `config`.
    pub fn command_line(&self, config: &VmConfig) -> Vec<String> {
        let mut line = vec![self.executable.display().to_string()];
        line.extend(build_args(config));
        line
    }

    /// Validate `config` and spawn the VM.
    ///
    /// Returns as soon as the OS reports the process exists; guest boot is
    /// not awaited.
    pub fn launch(&self, config: &VmConfig, sink: OutputSink) -> Result<VmProcess> {
        config.validate()?;

        if !self.executable.exists() {
            return Err(Error::ExecutableMissing {
                path: self.executable.clone(),
            });
        }

        let args = build_args(config);
        tracing::debug!(
            executable = %self.executable.display(),
            args = ?args,
            "launching vm"
        );

        // A stale socket file from a previous run would make QEMU fail to bind.
        if config.control_socket.exists() {
            let _ = std::fs::remove_file(&config.control_socket);
        }

        let (reader, writer) = combined_pipe()?;
        let writer_err = writer.try_clone()?;

        let mut command = Command::new(&self.executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err));

        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ExecutableMissing {
                path: self.executable.clone(),
            },
            _ => Error::spawn_failed(format!("{}: {}", self.executable.display(), e)),
        })?;
        // Drop our copies of the write end so the reader sees EOF on exit.
        drop(command);

        let pid = child.id();
        tracing::info!(pid, "vm process spawned");

        let output = std::thread::Builder::new()
            .name(format!("dockvm-output-{}", pid))
            .spawn(move || read_output(reader, sink));
        let output = match output {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to spawn output reader");
                None
            }
        };

        Ok(VmProcess {
            pid,
            child: Mutex::new(child),
            output: Mutex::new(output),
            started_at: Instant::now(),
        })
    }
}

/// Create a pipe whose ends are not inherited across `exec` by default.
#[cfg(target_os = "linux")]
pub(crate) fn combined_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];

    // SAFETY: fds is a valid two-element array.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    // SAFETY: pipe2() just returned these descriptors and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Create a pipe whose ends are not inherited across `exec` by default.
///
/// No `pipe2` here, so a fork racing between the two calls can inherit
/// the descriptors.
#[cfg(not(target_os = "linux"))]
pub(crate) fn combined_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];

    // SAFETY: fds is a valid two-element array.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    // SAFETY: pipe() just returned these descriptors and nothing else owns them.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    for fd in [fds[0], fds[1]] {
        // SAFETY: fd is open and owned above.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }

    Ok((read, write))
}

fn read_output(fd: OwnedFd, sink: OutputSink) {
    let mut reader = BufReader::new(std::fs::File::from(fd));
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                sink.line(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "vm output read failed");
                break;
            }
        }
    }

    tracing::debug!("vm output closed");
}

/// A spawned VM process.
#[derive(Debug)]
pub struct VmProcess {
    pid: u32,
    child: Mutex<Child>,
    output: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl VmProcess {
    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// When the process was spawned.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Non-blocking exit check. `Ok(None)` while the process is alive.
    pub fn try_exit(&self) -> Result<Option<ExitReason>> {
        let mut child = self.child.lock();
        Ok(child.try_wait()?.map(ExitReason::from))
    }

    /// Ask the process to shut down (SIGTERM). No-op once it has exited.
    pub fn terminate(&self) -> Result<()> {
        if self.try_exit()?.is_some() {
            return Ok(());
        }
        // SAFETY: pid belongs to our unreaped child, so it cannot be recycled.
        if unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Force kill (SIGKILL) and reap.
    pub fn kill(&self) -> Result<ExitReason> {
        let mut child = self.child.lock();
        if let Some(status) = child.try_wait()? {
            return Ok(status.into());
        }
        if let Err(e) = child.kill() {
            tracing::debug!(pid = self.pid, error = %e, "kill failed");
        }
        Ok(child.wait()?.into())
    }

    /// Poll for exit every `poll` until `timeout` elapses.
    ///
    /// Returns `Ok(None)` if the process is still alive at the deadline.
    pub fn wait_for_exit(&self, timeout: Duration, poll: Duration) -> Result<Option<ExitReason>> {
        let deadline = deadline_after(timeout);
        loop {
            if let Some(reason) = self.try_exit()? {
                return Ok(Some(reason));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }

    /// Wait up to `timeout` for the output reader to drain the pipe.
    ///
    /// Returns false if the reader is still running (a grandchild may hold
    /// the pipe open); it is then left detached.
    pub fn join_output(&self, timeout: Duration) -> bool {
        let Some(handle) = self.output.lock().take() else {
            return true;
        };

        let deadline = deadline_after(timeout);
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::config::{DiskFormat, PortForward};
    use crate::vm::test_support::fake_vm;

    fn config() -> VmConfig {
        VmConfig::builder("/data/alpine-disk.qcow2", "/data/alpine-virt.iso")
            .ram(2048)
            .cpus(2)
            .disk_format(DiskFormat::Qcow2)
            .forward(PortForward::tcp(2375, 2375))
            .forward(PortForward::tcp(2222, 22))
            .control_socket("/data/qmp.sock")
            .build()
    }

    fn flag_values<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    fn sink() -> (Arc<LogBuffer>, OutputSink) {
        let logs = Arc::new(LogBuffer::default());
        let sink = OutputSink::new(Arc::clone(&logs), EventNotifier::new());
        (logs, sink)
    }

    #[test]
    fn test_build_args_required_flags() {
        let args = build_args(&config());

        assert_eq!(flag_values(&args, "-machine"), vec!["q35,accel=tcg"]);
        assert_eq!(flag_values(&args, "-smp"), vec!["2"]);
        assert_eq!(flag_values(&args, "-m"), vec!["2048"]);
        assert_eq!(flag_values(&args, "-display"), vec!["none"]);
        assert_eq!(flag_values(&args, "-serial"), vec!["stdio"]);
        assert_eq!(
            flag_values(&args, "-drive"),
            vec![
                "file=/data/alpine-disk.qcow2,if=virtio,format=qcow2",
                "file=/data/alpine-virt.iso,media=cdrom,readonly=on",
            ]
        );
        assert_eq!(
            flag_values(&args, "-netdev"),
            vec!["user,id=net0,hostfwd=tcp::2375-:2375,hostfwd=tcp::2222-:22"]
        );
        assert_eq!(
            flag_values(&args, "-qmp"),
            vec!["unix:/data/qmp.sock,server,nowait"]
        );
        assert!(!args.iter().any(|a| a == "-daemonize"));
    }

    #[test]
    fn test_build_args_deterministic() {
        assert_eq!(build_args(&config()), build_args(&config()));
    }

    #[test]
    fn test_build_args_escapes_commas_in_paths() {
        let config = VmConfig::builder("/data/a,b/disk.img", "/data/boot.iso")
            .disk_format(DiskFormat::Raw)
            .control_socket("/run/x,y.sock")
            .build();
        let args = build_args(&config);
        assert!(args.contains(&"file=/data/a,,b/disk.img,if=virtio,format=raw".to_string()));
        assert!(args.contains(&"unix:/run/x,,y.sock,server,nowait".to_string()));
    }

    #[test]
    fn test_resolve_explicit_missing() {
        let err = resolve_executable(Some(Path::new("/nonexistent/qemu"))).unwrap_err();
        assert!(matches!(err, Error::ExecutableMissing { .. }));
        assert!(err.to_string().contains("/nonexistent/qemu"));
    }

    #[test]
    fn test_resolve_explicit_present() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_vm(dir.path(), "exit 0");
        assert_eq!(resolve_executable(Some(&exe)).unwrap(), exe);
    }

    #[test]
    fn test_find_in_path_locates_shell() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-program-xyz").is_none());
    }

    #[test]
    fn test_pipe_ends_close_on_exec() {
        use std::os::fd::AsRawFd;

        let (read, write) = combined_pipe().unwrap();
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags >= 0);
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    #[test]
    fn test_launch_rejects_invalid_config_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let exe = fake_vm(dir.path(), &format!("touch {}", marker.display()));

        let config = VmConfig::builder(dir.path().join("d"), dir.path().join("b"))
            .ram(100)
            .build();
        let (_, sink) = sink();
        let err = Launcher::new(&exe).launch(&config, sink).unwrap_err();

        assert!(matches!(err, Error::InvalidConfiguration(_)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!marker.exists());
    }

    #[test]
    fn test_launch_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let config = VmConfig::builder(dir.path().join("d"), dir.path().join("b")).build();
        let (_, sink) = sink();
        let err = Launcher::new(dir.path().join("no-such-qemu"))
            .launch(&config, sink)
            .unwrap_err();
        assert!(matches!(err, Error::ExecutableMissing { .. }));
    }

    #[test]
    fn test_launch_not_executable_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("not-exec");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();

        let config = VmConfig::builder(dir.path().join("d"), dir.path().join("b")).build();
        let (_, sink) = sink();
        let err = Launcher::new(&exe).launch(&config, sink).unwrap_err();
        assert!(matches!(err, Error::SpawnFailed(_)));
    }

    #[test]
    fn test_launch_captures_combined_output() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_vm(dir.path(), "echo out-line\necho err-line >&2\nprintf 'crlf\\r\\n'");
        let config = VmConfig::builder(dir.path().join("d"), dir.path().join("b"))
            .control_socket(dir.path().join("qmp.sock"))
            .build();
        let (logs, sink) = sink();

        let process = Launcher::new(&exe).launch(&config, sink).unwrap();
        let reason = process
            .wait_for_exit(Duration::from_secs(5), Duration::from_millis(20))
            .unwrap();
        assert_eq!(reason, Some(ExitReason::exited(0)));
        assert!(process.join_output(Duration::from_secs(5)));

        assert_eq!(logs.snapshot(10), vec!["out-line", "err-line", "crlf"]);
    }

    #[test]
    fn test_launch_passes_args_to_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_vm(dir.path(), "echo \"$@\"");
        let config = VmConfig::builder(dir.path().join("d"), dir.path().join("b"))
            .ram(1024)
            .cpus(3)
            .control_socket(dir.path().join("qmp.sock"))
            .build();
        let (logs, sink) = sink();

        let process = Launcher::new(&exe).launch(&config, sink).unwrap();
        process
            .wait_for_exit(Duration::from_secs(5), Duration::from_millis(20))
            .unwrap();
        process.join_output(Duration::from_secs(5));

        let line = logs.snapshot(1).pop().unwrap();
        let re = regex::Regex::new(r"-smp 3 -m 1024 -display none -serial stdio").unwrap();
        assert!(re.is_match(&line), "unexpected argv: {}", line);
    }

    #[test]
    fn test_terminate_then_kill() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_vm(
            dir.path(),
            "trap '' TERM\necho up\nwhile true; do sleep 0.1; done",
        );
        let config = VmConfig::builder(dir.path().join("d"), dir.path().join("b"))
            .control_socket(dir.path().join("qmp.sock"))
            .build();
        let (logs, sink) = sink();

        let process = Launcher::new(&exe).launch(&config, sink).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while logs.snapshot(1) != vec!["up"] {
            assert!(Instant::now() < deadline, "script never started");
            std::thread::sleep(Duration::from_millis(10));
        }
        process.terminate().unwrap();

        let still = process
            .wait_for_exit(Duration::from_millis(300), Duration::from_millis(50))
            .unwrap();
        assert!(still.is_none(), "TERM is trapped");

        let reason = process.kill().unwrap();
        assert_eq!(reason, ExitReason::signaled(libc::SIGKILL));
        assert!(process.try_exit().unwrap().is_some());

        // Idempotent after exit
        process.terminate().unwrap();
        assert_eq!(process.kill().unwrap(), ExitReason::signaled(libc::SIGKILL));
    }
}
