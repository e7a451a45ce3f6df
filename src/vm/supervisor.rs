//! VM supervisor.
//!
//! Owns the lifecycle phase and the VM process. All phase reads and writes
//! go through one mutex; that lock is never held across a spawn, a signal
//! wait, a control-channel round trip or a monitor join. An operation that
//! has to do slow work marks itself in flight, drops the lock, and takes it
//! again to publish the outcome. Concurrent start/stop/initialize calls see
//! the marker and get [`Error::Busy`].
//!
//! Log capture has its own lock (inside [`LogBuffer`]), so log reads never
//! wait behind a slow start or stop.

use super::config::{PortForward, Resources, VmConfig};
use super::events::{
    CallbackSubscription, EventKind, EventNotifier, LifecycleEvent, Subscription,
};
use super::launcher::{Launcher, OutputSink, VmProcess};
use super::logs::{LogBuffer, DEFAULT_LOG_CAP};
use super::monitor::{LivenessMonitor, MonitorHandle};
use super::state::{ExitReason, Phase};
use crate::config::{DockvmConfig, Timings};
use crate::control::{
    ControlChannel, ControlResponse, SshTarget, TransportOrder, MAX_COMMAND_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::storage::{self, InitOptions, InitReport, VmLayout};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How long stop waits for the output reader to drain the pipe.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Lifecycle operation currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Initialize,
    Start,
    Stop,
}

struct State {
    phase: Phase,
    op: Option<Operation>,
    process: Option<Arc<VmProcess>>,
    started_at: Option<Instant>,
    last_error: Option<String>,
    initialized: bool,
    /// Bumped on every successful launch; stale exit reports are ignored.
    run_id: u64,
    resources: Option<Resources>,
    monitor: Option<MonitorHandle>,
}

/// Everything a supervisor needs besides its runtime state.
pub struct SupervisorOptions {
    /// Persistent state location.
    pub layout: VmLayout,
    /// How to initialize the layout.
    pub init: InitOptions,
    /// Explicit VM binary; resolved on `$PATH` when `None`.
    pub qemu_binary: Option<PathBuf>,
    /// Port forwards applied to every launch.
    pub port_forwards: Vec<PortForward>,
    /// Resources for `restart` when nothing was started yet.
    pub default_resources: Resources,
    /// Polling intervals and bounds.
    pub timings: Timings,
    /// Log buffer cap, in characters.
    pub log_capacity: usize,
    /// Control channel to the running VM.
    pub channel: ControlChannel,
}

impl SupervisorOptions {
    /// Defaults for a layout: no forwards, standard channel and timings.
    pub fn new(layout: VmLayout) -> Self {
        let channel = ControlChannel::standard(
            layout.control_socket(),
            SshTarget::default(),
            TransportOrder::default(),
        );
        Self {
            layout,
            init: InitOptions::default(),
            qemu_binary: None,
            port_forwards: Vec::new(),
            default_resources: Resources::default(),
            timings: Timings::default(),
            log_capacity: DEFAULT_LOG_CAP,
            channel,
        }
    }

    /// Options taken from the user's configuration.
    pub fn from_config(config: &DockvmConfig) -> Result<Self> {
        let layout = config.layout()?;
        let channel = ControlChannel::standard(
            layout.control_socket(),
            config.ssh.clone(),
            config.transport,
        );
        Ok(Self {
            init: config.init_options(),
            qemu_binary: config.qemu_binary.clone(),
            port_forwards: config.port_forwards.clone(),
            default_resources: config.default_resources(),
            timings: config.timings,
            log_capacity: DEFAULT_LOG_CAP,
            channel,
            layout,
        })
    }
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStatus {
    /// Lifecycle phase.
    pub phase: Phase,
    /// Seconds since the process was spawned; 0 when not running.
    pub uptime_secs: u64,
    /// CPU usage of the VM process, in percent of one core.
    pub cpu_usage_percent: f32,
    /// Resident memory of the VM process relative to its configured RAM.
    pub memory_usage_percent: f32,
    /// OS process id while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Resources of the current (or last) launch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    /// Last failure, cleared by the next start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Whether `initialize` has completed.
    pub initialized: bool,
}

struct Shared {
    state: Mutex<State>,
    logs: Arc<LogBuffer>,
    events: EventNotifier,
    channel: Mutex<ControlChannel>,
    metrics: Mutex<sysinfo::System>,
    layout: VmLayout,
    init: InitOptions,
    qemu_binary: Option<PathBuf>,
    port_forwards: Vec<PortForward>,
    default_resources: Resources,
    timings: Timings,
}

/// Supervises one VM.
///
/// Safe to share between threads (`Arc<Supervisor>`); every operation takes
/// `&self`. Dropping a supervisor whose VM is running stops the VM.
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Create an idle supervisor (`stopped`, not initialized).
    pub fn new(options: SupervisorOptions) -> Self {
        let SupervisorOptions {
            layout,
            init,
            qemu_binary,
            port_forwards,
            default_resources,
            timings,
            log_capacity,
            channel,
        } = options;

        let shared = Shared {
            state: Mutex::new(State {
                phase: Phase::Stopped,
                op: None,
                process: None,
                started_at: None,
                last_error: None,
                initialized: false,
                run_id: 0,
                resources: None,
                monitor: None,
            }),
            logs: Arc::new(LogBuffer::new(log_capacity)),
            events: EventNotifier::new(),
            channel: Mutex::new(channel),
            metrics: Mutex::new(sysinfo::System::new()),
            layout,
            init,
            qemu_binary,
            port_forwards,
            default_resources,
            timings,
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Supervisor configured from the user's settings.
    pub fn from_config(config: &DockvmConfig) -> Result<Self> {
        Ok(Self::new(SupervisorOptions::from_config(config)?))
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// Whether `initialize` has completed on this supervisor.
    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().initialized
    }

    /// Persistent state location.
    pub fn layout(&self) -> &VmLayout {
        &self.shared.layout
    }

    /// Prepare persistent state (disk, boot media, profile).
    ///
    /// Moves `stopped`/`error` to `initializing`, where the supervisor rests
    /// until started. Idempotent; a no-op while the VM is running.
    pub fn initialize(&self) -> Result<InitReport> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if state.op.is_some() || state.phase.is_busy() {
                return Err(Error::busy(state.phase));
            }
            if state.phase == Phase::Running {
                tracing::debug!("initialize while running is a no-op");
                return Ok(InitReport::default());
            }
            shared.transition(
                &mut state,
                Phase::Initializing,
                Some("preparing vm storage".into()),
            );
            state.op = Some(Operation::Initialize);
        }

        let result = storage::initialize(&shared.layout, &shared.init);

        let mut state = shared.state.lock();
        state.op = None;
        match result {
            Ok(report) => {
                state.initialized = true;
                tracing::info!(
                    created = report.created.len(),
                    existing = report.existing.len(),
                    dir = %shared.layout.dir().display(),
                    "vm storage ready"
                );
                Ok(report)
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                shared.transition(&mut state, Phase::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Launch the VM with the given memory and CPU count.
    ///
    /// Returns once the process exists; the guest may still be booting, so
    /// the control channel is not necessarily ready yet.
    pub fn start(&self, ram_mb: u32, cpus: u8) -> Result<()> {
        let resources = Resources::new(ram_mb, cpus);
        // Rejected before any state change.
        resources.validate()?;

        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if state.op.is_some() || state.phase.is_busy() {
                return Err(Error::busy(state.phase));
            }
            if state.phase == Phase::Running {
                return Err(Error::InvalidState {
                    expected: "stopped".into(),
                    actual: state.phase.to_string(),
                });
            }
            if !state.initialized {
                return Err(Error::NotInitialized);
            }

            if state.phase != Phase::Initializing {
                shared.transition(&mut state, Phase::Initializing, None);
            }
            shared.transition(
                &mut state,
                Phase::Starting,
                Some(format!("{} MB, {} cpus", ram_mb, cpus)),
            );
            state.last_error = None;
            state.op = Some(Operation::Start);
        }

        // A connection left over from a previous run would talk to a dead socket.
        shared.channel.lock().close();

        let launched = shared.launch(resources);

        let mut state = shared.state.lock();
        state.op = None;

        let process = match launched {
            Ok(process) => Arc::new(process),
            Err(e) => {
                tracing::error!(error = %e, "vm launch failed");
                state.last_error = Some(e.to_string());
                shared.transition(&mut state, Phase::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        state.run_id += 1;
        let monitor = match spawn_monitor(shared, Arc::clone(&process), state.run_id) {
            Ok(monitor) => monitor,
            Err(e) => {
                let _ = process.kill();
                state.last_error = Some(e.to_string());
                shared.transition(&mut state, Phase::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        state.started_at = Some(process.started_at());
        state.resources = Some(resources);
        state.process = Some(process);
        state.monitor = Some(monitor);
        shared.transition(&mut state, Phase::Running, None);
        Ok(())
    }

    /// Shut the VM down.
    ///
    /// Sends SIGTERM, waits up to the stop timeout, then SIGKILLs. Always
    /// ends in `stopped` (or `error` if the process could not be reaped).
    /// A no-op when no VM is running.
    pub fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let (process, monitor) = {
            let mut state = shared.state.lock();
            if state.op.is_some() || state.phase.is_busy() {
                return Err(Error::busy(state.phase));
            }
            if state.phase != Phase::Running {
                tracing::debug!(phase = %state.phase, "stop with no running vm is a no-op");
                return Ok(());
            }
            shared.transition(&mut state, Phase::Stopping, None);
            state.op = Some(Operation::Stop);
            (state.process.take(), state.monitor.take())
        };

        // Must not hold the state lock here: the monitor's exit callback takes it.
        if let Some(monitor) = monitor {
            monitor.stop();
        }

        match shared.channel.try_lock_for(shared.timings.stop_timeout) {
            Some(mut channel) => channel.close(),
            None => tracing::warn!("control channel busy, not closed before stop"),
        }

        let outcome = match &process {
            Some(process) => shared.shutdown_process(process),
            None => Ok("no process".to_string()),
        };

        if let Some(process) = &process {
            if !process.join_output(OUTPUT_DRAIN) {
                tracing::debug!("output reader still running after stop");
            }
        }
        shared.remove_control_socket();

        let mut state = shared.state.lock();
        state.op = None;
        state.started_at = None;
        match outcome {
            Ok(message) => {
                shared.transition(&mut state, Phase::Stopped, Some(message));
                Ok(())
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                shared.transition(&mut state, Phase::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stop, wait for the settle delay, then start with the last resources
    /// (or the defaults if nothing was started yet).
    pub fn restart(&self) -> Result<()> {
        self.stop()?;
        std::thread::sleep(self.shared.timings.restart_settle);

        let resources = self
            .shared
            .state
            .lock()
            .resources
            .unwrap_or(self.shared.default_resources);
        self.start(resources.ram_mb, resources.cpus)
    }

    /// Snapshot of phase, uptime and process usage.
    pub fn status(&self) -> VmStatus {
        let (phase, pid, started_at, resources, last_error, initialized) = {
            let state = self.shared.state.lock();
            (
                state.phase,
                state.process.as_ref().map(|p| p.pid()),
                state.started_at,
                state.resources,
                state.last_error.clone(),
                state.initialized,
            )
        };

        let running = phase == Phase::Running;
        let uptime_secs = match (running, started_at) {
            (true, Some(at)) => at.elapsed().as_secs(),
            _ => 0,
        };

        let (cpu_usage_percent, memory_usage_percent) = match (running, pid, resources) {
            (true, Some(pid), Some(resources)) => self.shared.process_usage(pid, resources),
            _ => (0.0, 0.0),
        };

        VmStatus {
            phase,
            uptime_secs,
            cpu_usage_percent,
            memory_usage_percent,
            pid: if running { pid } else { None },
            resources,
            last_error,
            initialized,
        }
    }

    /// Run a command in the VM with the default timeout and return its output.
    pub fn send_command(&self, command: &str) -> Result<String> {
        self.send_command_with_timeout(command, self.shared.timings.command_timeout)
            .map(|resp| resp.output)
    }

    /// Run a command in the VM, bounded by `timeout`.
    ///
    /// Fails with [`Error::NotRunning`] outside `running` without touching
    /// the channel. A failed command never changes the phase. Timeouts above
    /// [`MAX_COMMAND_TIMEOUT`] are rejected.
    pub fn send_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ControlResponse> {
        if timeout > MAX_COMMAND_TIMEOUT {
            return Err(Error::invalid_config(format!(
                "command timeout {:?} exceeds {:?}",
                timeout, MAX_COMMAND_TIMEOUT
            )));
        }

        let phase = self.phase();
        if phase != Phase::Running {
            return Err(Error::not_running(phase));
        }

        let response = self.shared.channel.lock().send(command, timeout)?;
        self.shared.events.publish(LifecycleEvent::log(format!(
            "$ {}\n{}",
            command, response.output
        )));
        Ok(response)
    }

    /// Last `max_lines` captured lines, each terminated by `\n`.
    pub fn logs(&self, max_lines: usize) -> String {
        self.shared
            .logs
            .snapshot(max_lines)
            .into_iter()
            .fold(String::new(), |mut out, line| {
                out.push_str(&line);
                out.push('\n');
                out
            })
    }

    /// Last `max_lines` captured lines.
    pub fn log_lines(&self, max_lines: usize) -> Vec<String> {
        self.shared.logs.snapshot(max_lines)
    }

    /// Subscribe to events of one kind (or all with `None`).
    pub fn subscribe(&self, kind: Option<EventKind>) -> Subscription {
        self.shared.events.subscribe(kind)
    }

    /// Call `callback` for every event until the handle is dropped.
    pub fn subscribe_with<F>(&self, kind: Option<EventKind>, callback: F) -> CallbackSubscription
    where
        F: FnMut(LifecycleEvent) + Send + 'static,
    {
        self.shared.events.subscribe_with(kind, callback)
    }

    /// The VM configuration a start with `resources` would launch.
    pub fn vm_config(&self, resources: Resources) -> Result<VmConfig> {
        self.shared.vm_config(resources)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.phase() == Phase::Running {
            // Best-effort cleanup
            if let Err(e) = self.stop() {
                tracing::warn!(error = %e, "failed to stop vm on drop");
            }
        }
    }
}

impl Shared {
    /// Apply a phase change and publish it. Must be called with the state lock held.
    fn transition(&self, state: &mut State, to: Phase, message: Option<String>) {
        let from = state.phase;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            tracing::warn!(%from, %to, "ignoring illegal phase transition");
            return;
        }

        state.phase = to;
        match &message {
            Some(msg) => tracing::info!(%from, %to, message = %msg, "vm phase changed"),
            None => tracing::info!(%from, %to, "vm phase changed"),
        }
        self.events
            .publish(LifecycleEvent::transition(from, to, message));
    }

    fn vm_config(&self, resources: Resources) -> Result<VmConfig> {
        let format = self.layout.disk_format()?;
        Ok(
            VmConfig::builder(self.layout.disk(), self.layout.boot_media())
                .resources(resources)
                .disk_format(format)
                .forwards(self.port_forwards.iter().copied())
                .control_socket(self.layout.control_socket())
                .build(),
        )
    }

    fn launch(&self, resources: Resources) -> Result<VmProcess> {
        if !self.layout.is_initialized() {
            return Err(Error::storage(format!(
                "vm storage missing in {}; run initialize",
                self.layout.dir().display()
            )));
        }
        if self.layout.profile().is_file() {
            let profile = self.layout.load_profile()?;
            if !profile.is_compatible() {
                return Err(Error::storage(format!(
                    "{} was written by a newer dockvm (format {})",
                    self.layout.profile().display(),
                    profile.format_version
                )));
            }
        }
        let config = self.vm_config(resources)?;
        let launcher = Launcher::resolve(self.qemu_binary.as_deref())?;
        let sink = OutputSink::new(Arc::clone(&self.logs), self.events.clone());
        launcher.launch(&config, sink)
    }

    /// SIGTERM, bounded wait, SIGKILL. Returns a description of the exit.
    fn shutdown_process(&self, process: &VmProcess) -> Result<String> {
        let pid = process.pid();
        tracing::info!(pid, "stopping vm");

        let graceful = match process.terminate() {
            Ok(()) => process.wait_for_exit(self.timings.stop_timeout, self.timings.stop_poll),
            Err(e) => Err(e),
        };

        match graceful {
            Ok(Some(reason)) => Ok(reason.to_string()),
            Ok(None) => {
                tracing::warn!(
                    pid,
                    timeout = ?self.timings.stop_timeout,
                    "vm did not exit in time, killing"
                );
                let reason = process.kill()?;
                Ok(format!("forced: {}", reason))
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "graceful stop failed, killing");
                let reason = process.kill()?;
                Ok(format!("forced: {}", reason))
            }
        }
    }

    /// Exit reported by the liveness monitor.
    fn handle_exit(&self, run_id: u64, reason: ExitReason) {
        let (process, monitor) = {
            let mut state = self.state.lock();
            // A stop (or a newer run) already owns this process.
            if state.run_id != run_id || state.phase != Phase::Running {
                return;
            }

            let to = reason.settled_phase();
            if to == Phase::Error {
                state.last_error = Some(Error::UnexpectedExit(reason.to_string()).to_string());
            }
            state.started_at = None;
            self.transition(
                &mut state,
                to,
                Some(format!("process exited unexpectedly: {}", reason)),
            );
            (state.process.take(), state.monitor.take())
        };
        drop(monitor);

        tracing::warn!(%reason, "vm process exited unexpectedly");
        self.channel.lock().close();
        if let Some(process) = process {
            process.join_output(OUTPUT_DRAIN);
        }
        self.remove_control_socket();
    }

    fn remove_control_socket(&self) {
        let socket = self.layout.control_socket();
        match std::fs::remove_file(&socket) {
            Ok(()) => tracing::debug!(socket = %socket.display(), "removed control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = %socket.display(), error = %e, "failed to remove control socket"),
        }
    }

    /// (cpu %, memory %) of the VM process.
    fn process_usage(&self, pid: u32, resources: Resources) -> (f32, f32) {
        use sysinfo::Pid;

        let pid = Pid::from_u32(pid);
        let mut sys = self.metrics.lock();
        sys.refresh_process(pid);

        match sys.process(pid) {
            Some(proc_info) => {
                let ram_bytes = u64::from(resources.ram_mb) * 1024 * 1024;
                let memory = (proc_info.memory() as f64 / ram_bytes as f64 * 100.0).min(100.0);
                (proc_info.cpu_usage(), memory as f32)
            }
            None => (0.0, 0.0),
        }
    }
}

fn spawn_monitor(
    shared: &Arc<Shared>,
    process: Arc<VmProcess>,
    run_id: u64,
) -> Result<MonitorHandle> {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    LivenessMonitor::spawn(process, shared.timings.poll_interval, move |reason| {
        if let Some(shared) = weak.upgrade() {
            shared.handle_exit(run_id, reason);
        }
    })
}
