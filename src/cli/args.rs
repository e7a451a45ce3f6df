//! Print the VM command line.

use clap::Args;
use dockvm::storage::VmLayout;
use dockvm::vm::launcher::QEMU_PROGRAM;
use dockvm::vm::{DiskFormat, Launcher, Resources, VmConfig};
use dockvm::{DockvmConfig, Result};

/// Show the exact command `run` would execute, without starting anything.
#[derive(Args, Debug)]
pub struct ArgsCmd {
    /// Memory in MiB (512-8192)
    #[arg(long, value_name = "MB")]
    ram: Option<u32>,

    /// Number of vCPUs (1-8)
    #[arg(long, value_name = "N")]
    cpus: Option<u8>,
}

impl ArgsCmd {
    pub fn run(self, config: &DockvmConfig) -> Result<()> {
        let layout = config.layout()?;
        let resources = Resources::new(
            self.ram.unwrap_or(config.default_ram_mb),
            self.cpus.unwrap_or(config.default_cpus),
        );
        let vm_config = vm_config(config, &layout, resources)?;
        vm_config.validate()?;

        let launcher = match Launcher::resolve(config.qemu_binary.as_deref()) {
            Ok(launcher) => launcher,
            Err(e) => {
                tracing::warn!(error = %e, "vm binary not found, showing program name");
                Launcher::new(QEMU_PROGRAM)
            }
        };

        let line: Vec<String> = launcher
            .command_line(&vm_config)
            .into_iter()
            .map(|arg| shell_quote(&arg))
            .collect();
        println!("{}", line.join(" \\\n    "));
        Ok(())
    }
}

fn vm_config(config: &DockvmConfig, layout: &VmLayout, resources: Resources) -> Result<VmConfig> {
    let format = if layout.disk().is_file() {
        layout.disk_format()?
    } else {
        DiskFormat::default()
    };
    Ok(VmConfig::builder(layout.disk(), layout.boot_media())
        .resources(resources)
        .disk_format(format)
        .forwards(config.port_forwards.iter().copied())
        .control_socket(layout.control_socket())
        .build())
}

/// Quote an argument for copy-pasting into a POSIX shell.
fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
