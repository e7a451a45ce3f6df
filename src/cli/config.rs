//! Configuration CLI commands.

use clap::{Args, Subcommand};
use dockvm::{DockvmConfig, Result};
use std::path::Path;

/// Configuration commands
#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Show current configuration
    Show(ShowCmd),

    /// Show the path to the configuration file
    Path,

    /// Change the default memory and CPU count
    SetDefaults(SetDefaultsCmd),
}

impl ConfigCmd {
    pub fn run(self, config: &mut DockvmConfig, config_path: &Path) -> Result<()> {
        match self {
            ConfigCmd::Show(cmd) => cmd.run(config, config_path),
            ConfigCmd::Path => {
                println!("{}", config_path.display());
                Ok(())
            }
            ConfigCmd::SetDefaults(cmd) => cmd.run(config, config_path),
        }
    }
}

// ============================================================================
// Show Command
// ============================================================================

/// Show current configuration
#[derive(Args, Debug)]
pub struct ShowCmd {
    /// Print the raw TOML instead of a summary
    #[arg(long)]
    toml: bool,
}

impl ShowCmd {
    pub fn run(self, config: &DockvmConfig, config_path: &Path) -> Result<()> {
        if self.toml {
            print!("{}", config.to_toml()?);
            return Ok(());
        }

        println!("Global Configuration:");
        let status = if config_path.exists() { "" } else { " (not created, using defaults)" };
        println!("  Config file: {}{}", config_path.display(), status);
        println!("  Data directory: {}", config.data_dir()?.display());
        println!("  Default CPUs: {}", config.default_cpus);
        println!("  Default Memory: {} MiB", config.default_ram_mb);
        println!("  Disk size: {} MiB", config.disk_size_mb);
        match &config.qemu_binary {
            Some(path) => println!("  VM binary: {}", path.display()),
            None => println!("  VM binary: (search $PATH)"),
        }
        match &config.boot_media_source {
            Some(path) => println!("  Boot media source: {}", path.display()),
            None => println!("  Boot media source: (not set)"),
        }
        println!(
            "  SSH: {}:{} as {}",
            config.ssh.host, config.ssh.port, config.ssh.user
        );
        println!("  Transport: {:?}", config.transport);

        println!();
        println!("  Port forwards:");
        for fwd in &config.port_forwards {
            println!("    {}", fwd.to_hostfwd());
        }
        Ok(())
    }
}

// ============================================================================
// Set-Defaults Command
// ============================================================================

/// Change the default memory and CPU count
#[derive(Args, Debug)]
pub struct SetDefaultsCmd {
    /// Memory in MiB (512-8192)
    #[arg(long, value_name = "MB")]
    ram: Option<u32>,

    /// Number of vCPUs (1-8)
    #[arg(long, value_name = "N")]
    cpus: Option<u8>,
}

impl SetDefaultsCmd {
    pub fn run(self, config: &mut DockvmConfig, config_path: &Path) -> Result<()> {
        config.set_default_resources(self.ram, self.cpus)?;
        config.save_to(config_path)?;
        println!(
            "Defaults: {} MiB, {} cpus",
            config.default_ram_mb, config.default_cpus
        );
        Ok(())
    }
}
