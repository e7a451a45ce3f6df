//! Run the VM in the foreground.

use clap::Args;
use dockvm::vm::{LifecycleEvent, Phase, PortForward, SupervisorOptions};
use dockvm::{DockvmConfig, Error, Result, Supervisor};

use crate::cli::parsers::parse_port;

/// Boot the VM and stream its console until Ctrl+C or until it exits.
#[derive(Args, Debug)]
#[command(after_long_help = "\
The VM is stopped (SIGTERM, then SIGKILL after the stop timeout) when this
command exits.

EXAMPLES:
  dockvm run                           Defaults from the config (2048 MB, 2 cpus)
  dockvm run --ram 4096 --cpus 4
  dockvm run -p 2375:2375 -p 2222:22   Replace the configured port forwards
  dockvm run --quiet                   Don't echo the console")]
pub struct RunCmd {
    /// Memory in MiB (512-8192)
    #[arg(long, value_name = "MB")]
    ram: Option<u32>,

    /// Number of vCPUs (1-8)
    #[arg(long, value_name = "N")]
    cpus: Option<u8>,

    /// Port forward, replaces the configured list (repeatable)
    #[arg(short = 'p', long = "port", value_parser = parse_port, value_name = "[PROTO/]HOST:GUEST")]
    ports: Vec<PortForward>,

    /// Don't echo VM console output
    #[arg(short, long)]
    quiet: bool,
}

impl RunCmd {
    pub fn run(self, config: &DockvmConfig) -> Result<()> {
        let mut options = SupervisorOptions::from_config(config)?;
        if !self.ports.is_empty() {
            options.port_forwards = self.ports.clone();
        }
        let supervisor = Supervisor::new(options);

        let ram_mb = self.ram.unwrap_or(config.default_ram_mb);
        let cpus = self.cpus.unwrap_or(config.default_cpus);

        supervisor.initialize()?;
        let mut events = supervisor.subscribe(None);
        supervisor.start(ram_mb, cpus)?;

        let status = supervisor.status();
        eprintln!(
            "VM running (pid {}, {} MB, {} cpus). Press Ctrl+C to stop.",
            status.pid.unwrap_or_default(),
            ram_mb,
            cpus
        );

        let quiet = self.quiet;
        let runtime = crate::cli::runtime()?;
        runtime.block_on(async move {
            let shutdown = crate::cli::shutdown_signal();
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(LifecycleEvent::Log { line }) => {
                            if !quiet {
                                println!("{}", line);
                            }
                        }
                        Some(LifecycleEvent::Transition { to, message, .. }) => {
                            if matches!(to, Phase::Stopped | Phase::Error) {
                                if let Some(message) = message {
                                    eprintln!("VM {}: {}", to, message);
                                }
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut shutdown => {
                        eprintln!("\nStopping VM...");
                        break;
                    }
                }
            }
        });

        supervisor.stop()?;

        match supervisor.status() {
            status if status.phase == Phase::Error => Err(Error::UnexpectedExit(
                status.last_error.unwrap_or_else(|| "unknown".into()),
            )),
            _ => Ok(()),
        }
    }
}
