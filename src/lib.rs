//! dockvm - supervisor for a QEMU virtual machine hosting a Docker Engine.
//!
//! The [`Supervisor`] owns one VM process: it prepares persistent state,
//! launches QEMU with the requested memory and CPU count, watches the
//! process, captures its console output, carries commands into the VM and
//! reports every lifecycle change to subscribers.
//!
//! ```no_run
//! use dockvm::{DockvmConfig, Supervisor};
//!
//! # fn main() -> dockvm::Result<()> {
//! let supervisor = Supervisor::from_config(&DockvmConfig::load()?)?;
//! supervisor.initialize()?;
//! supervisor.start(2048, 2)?;
//! println!("{}", supervisor.send_command("info status")?);
//! supervisor.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod storage;
pub mod vm;

pub use config::DockvmConfig;
pub use error::{Error, Result};
pub use vm::{LifecycleEvent, Phase, Supervisor, VmStatus};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
