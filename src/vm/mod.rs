//! VM lifecycle management.
//!
//! - [`Supervisor`]: owns one VM and its lifecycle phase
//! - [`Launcher`]: builds the command line and spawns the process
//! - [`LivenessMonitor`]: notices when the process dies on its own
//! - [`LogBuffer`]: bounded capture of the process output
//! - [`EventNotifier`]: fan-out of transitions and log lines

pub mod config;
pub mod events;
pub mod launcher;
pub mod logs;
pub mod monitor;
pub mod state;
pub mod supervisor;

pub use config::{DiskFormat, PortForward, Protocol, Resources, VmConfig};
pub use events::{CallbackSubscription, EventKind, EventNotifier, LifecycleEvent, Subscription};
pub use launcher::{Launcher, OutputSink, VmProcess};
pub use logs::LogBuffer;
pub use monitor::{LivenessMonitor, MonitorHandle};
pub use state::{ExitReason, Phase};
pub use supervisor::{Supervisor, SupervisorOptions, VmStatus};
