//! Prepare the VM's persistent state.

use clap::Args;
use dockvm::{DockvmConfig, Result, Supervisor};
use std::path::{Path, PathBuf};

/// Create the disk image, copy the boot media and write the machine profile.
#[derive(Args, Debug)]
#[command(after_long_help = "\
Existing files are left untouched, so running init twice is safe.

EXAMPLES:
  dockvm init --boot-media ~/Downloads/alpine-virt-3.19.1-x86_64.iso
  dockvm init --disk-size 20480")]
pub struct InitCmd {
    /// Boot media to copy into the data directory (remembered in the config)
    #[arg(long, value_name = "ISO")]
    boot_media: Option<PathBuf>,

    /// Size of a newly created disk in MiB (remembered in the config)
    #[arg(long, value_name = "MB")]
    disk_size: Option<u64>,
}

impl InitCmd {
    pub fn run(self, config: &mut DockvmConfig, config_path: &Path) -> Result<()> {
        let mut changed = false;
        if let Some(path) = self.boot_media {
            config.boot_media_source = Some(std::fs::canonicalize(&path).unwrap_or(path));
            changed = true;
        }
        if let Some(size) = self.disk_size {
            config.disk_size_mb = size;
            changed = true;
        }
        if changed {
            config.save_to(config_path)?;
        }

        let supervisor = Supervisor::from_config(config)?;
        let report = supervisor.initialize()?;

        println!("Data directory: {}", supervisor.layout().dir().display());
        for path in &report.created {
            println!("  created  {}", path.display());
        }
        for path in &report.existing {
            println!("  exists   {}", path.display());
        }
        if report.is_noop() {
            println!("Already initialized.");
        }
        Ok(())
    }
}
