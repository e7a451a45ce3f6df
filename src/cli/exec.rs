//! Send a command to a running VM.

use clap::Args;
use dockvm::control::{ControlChannel, TransportOrder};
use dockvm::{DockvmConfig, Result};
use std::time::Duration;

use crate::cli::parsers::{parse_duration, parse_transport};

/// Run a command in the VM started by `dockvm run` or `dockvm serve`.
#[derive(Args, Debug)]
#[command(after_long_help = "\
Commands go to the QEMU monitor over QMP first and fall back to SSH into
the guest (localhost:2222 by default). Use --via to pick one.

EXAMPLES:
  dockvm exec info status              QEMU monitor command
  dockvm exec --via ssh docker ps      Shell command in the guest
  dockvm exec --timeout 1m -- apk update")]
pub struct ExecCmd {
    /// Timeout for the command
    #[arg(long, value_parser = parse_duration, value_name = "DURATION")]
    timeout: Option<Duration>,

    /// Transport: qmp, ssh, qmp-first or ssh-first
    #[arg(long, value_parser = parse_transport, value_name = "TRANSPORT")]
    via: Option<TransportOrder>,

    /// Command to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl ExecCmd {
    pub fn run(self, config: &DockvmConfig) -> Result<()> {
        let layout = config.layout()?;
        let mut channel = ControlChannel::standard(
            layout.control_socket(),
            config.ssh.clone(),
            self.via.unwrap_or(config.transport),
        );

        let command = self.command.join(" ");
        let timeout = self.timeout.unwrap_or(config.timings.command_timeout);

        let response = channel.send(&command, timeout);
        channel.close();
        let response = response.map_err(|e| {
            if e.is_retryable() {
                eprintln!("The VM may still be booting; try again shortly.");
            }
            e
        })?;

        tracing::debug!(transport = %response.transport, "command completed");
        let output = response.output.trim_end();
        if !output.is_empty() {
            println!("{}", output);
        }
        Ok(())
    }
}
