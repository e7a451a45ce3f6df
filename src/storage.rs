//! Persistent VM state on the host.
//!
//! Everything one VM needs lives in a single data directory:
//!
//! ```text
//! <data_dir>/
//! ├── alpine-disk.img    # Primary disk (qcow2 when qemu-img is available, else sparse raw)
//! ├── alpine-virt.iso    # Boot media, copied from the configured source
//! ├── machine.json       # Profile describing the layout
//! └── qmp.sock           # Control socket (exists only while the VM runs)
//! ```

use crate::error::{Error, Result};
use crate::vm::config::DiskFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Default disk size (10 GiB, sparse).
pub const DEFAULT_DISK_SIZE_MB: u64 = 10240;

/// Primary disk filename.
pub const DISK_FILENAME: &str = "alpine-disk.img";

/// Boot media filename.
pub const BOOT_MEDIA_FILENAME: &str = "alpine-virt.iso";

/// Profile filename.
pub const PROFILE_FILENAME: &str = "machine.json";

/// Control socket filename.
pub const CONTROL_SOCKET_FILENAME: &str = "qmp.sock";

/// Paths of one VM's persistent state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLayout {
    dir: PathBuf,
}

impl VmLayout {
    /// Layout rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Primary disk image.
    pub fn disk(&self) -> PathBuf {
        self.dir.join(DISK_FILENAME)
    }

    /// Boot media.
    pub fn boot_media(&self) -> PathBuf {
        self.dir.join(BOOT_MEDIA_FILENAME)
    }

    /// Machine profile.
    pub fn profile(&self) -> PathBuf {
        self.dir.join(PROFILE_FILENAME)
    }

    /// Control socket.
    pub fn control_socket(&self) -> PathBuf {
        self.dir.join(CONTROL_SOCKET_FILENAME)
    }

    /// Whether disk and boot media are both present.
    pub fn is_initialized(&self) -> bool {
        self.disk().is_file() && self.boot_media().is_file()
    }

    /// Read the machine profile.
    pub fn load_profile(&self) -> Result<MachineProfile> {
        let path = self.profile();
        let data = std::fs::read_to_string(&path)
            .map_err(|e| Error::storage(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| Error::storage(format!("parse {}: {}", path.display(), e)))
    }

    /// Detected format of the primary disk.
    pub fn disk_format(&self) -> Result<DiskFormat> {
        DiskFormat::detect(&self.disk())
    }
}

/// Description of an initialized layout, stored as `machine.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineProfile {
    /// Profile format version.
    pub format_version: u32,

    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,

    /// dockvm version that created the layout.
    pub dockvm_version: String,

    /// Primary disk format.
    pub disk_format: DiskFormat,

    /// Requested disk size in MiB.
    pub disk_size_mb: u64,
}

impl MachineProfile {
    /// Current format version.
    pub const CURRENT_VERSION: u32 = 1;

    fn new(disk_format: DiskFormat, disk_size_mb: u64) -> Self {
        Self {
            format_version: Self::CURRENT_VERSION,
            created_at: current_timestamp(),
            dockvm_version: env!("CARGO_PKG_VERSION").to_string(),
            disk_format,
            disk_size_mb,
        }
    }

    /// Check if this profile can be read by the current dockvm.
    pub fn is_compatible(&self) -> bool {
        self.format_version <= Self::CURRENT_VERSION
    }
}

/// Inputs to [`initialize`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Size of a newly created disk.
    pub disk_size_mb: u64,

    /// Boot media to copy in when the layout has none.
    pub boot_media_source: Option<PathBuf>,

    /// `qemu-img` binary. `None` looks it up on `$PATH`.
    pub qemu_img: Option<PathBuf>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            disk_size_mb: DEFAULT_DISK_SIZE_MB,
            boot_media_source: None,
            qemu_img: None,
        }
    }
}

/// What [`initialize`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    /// Files created by this call.
    pub created: Vec<PathBuf>,
    /// Files that were already present and left untouched.
    pub existing: Vec<PathBuf>,
}

impl InitReport {
    /// Whether the call changed nothing.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
    }
}

/// Prepare the layout: data directory, boot media, disk and profile.
///
/// Idempotent. Existing files are never overwritten, so a second call
/// only reports them as existing.
pub fn initialize(layout: &VmLayout, options: &InitOptions) -> Result<InitReport> {
    let mut report = InitReport::default();

    std::fs::create_dir_all(layout.dir()).map_err(|e| {
        Error::storage(format!("create {}: {}", layout.dir().display(), e))
    })?;

    let boot_media = layout.boot_media();
    if boot_media.is_file() {
        report.existing.push(boot_media);
    } else {
        let source = options
            .boot_media_source
            .as_deref()
            .filter(|s| s.is_file())
            .ok_or_else(|| Error::BootMediaNotFound {
                path: options
                    .boot_media_source
                    .clone()
                    .unwrap_or_else(|| boot_media.clone()),
            })?;
        copy_atomic(source, &boot_media)?;
        tracing::info!(
            source = %source.display(),
            dest = %boot_media.display(),
            "copied boot media"
        );
        report.created.push(boot_media);
    }

    let disk = layout.disk();
    let format = if disk.is_file() {
        report.existing.push(disk.clone());
        DiskFormat::detect(&disk)?
    } else {
        let format = create_disk(&disk, options)?;
        report.created.push(disk);
        format
    };

    let profile = layout.profile();
    if profile.is_file() {
        report.existing.push(profile);
    } else {
        let data = serde_json::to_string_pretty(&MachineProfile::new(format, options.disk_size_mb))
            .map_err(|e| Error::storage(e.to_string()))?;
        std::fs::write(&profile, data)?;
        report.created.push(profile);
    }

    Ok(report)
}

/// Create the primary disk, preferring qcow2.
fn create_disk(path: &Path, options: &InitOptions) -> Result<DiskFormat> {
    let size_bytes = options.disk_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
        Error::storage(format!("disk size too large: {} MB", options.disk_size_mb))
    })?;

    let qemu_img = options
        .qemu_img
        .clone()
        .or_else(|| crate::vm::launcher::find_in_path("qemu-img"));

    if let Some(qemu_img) = qemu_img {
        let size = format!("{}M", options.disk_size_mb);
        let output = Command::new(&qemu_img)
            .args(["create", "-f", "qcow2"])
            .arg(path)
            .arg(&size)
            .output();

        match output {
            Ok(out) if out.status.success() => {
                tracing::info!(path = %path.display(), size = %size, "created qcow2 disk");
                return Ok(DiskFormat::Qcow2);
            }
            Ok(out) => {
                tracing::warn!(
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "qemu-img failed, falling back to raw disk"
                );
                let _ = std::fs::remove_file(path);
            }
            Err(e) => {
                tracing::warn!(error = %e, "qemu-img not runnable, falling back to raw disk");
            }
        }
    }

    create_sparse(path, size_bytes)?;
    Ok(DiskFormat::Raw)
}

/// Create a sparse raw disk image.
fn create_sparse(path: &Path, size_bytes: u64) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    if size_bytes == 0 {
        return Err(Error::storage("disk size must be positive"));
    }

    tracing::info!(path = %path.display(), size_mb = size_bytes / (1024 * 1024), "creating sparse raw disk");

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;

    // Seek to end and write a single byte to create sparse file
    file.seek(SeekFrom::Start(size_bytes - 1))?;
    file.write_all(&[0])?;
    file.sync_all()?;

    Ok(())
}

/// Copy via a temporary sibling so a crash never leaves a half-copied file.
fn copy_atomic(from: &Path, to: &Path) -> Result<()> {
    let tmp = to.with_extension("partial");
    std::fs::copy(from, &tmp)
        .map_err(|e| Error::storage(format!("copy {}: {}", from.display(), e)))?;
    std::fs::rename(&tmp, to)?;
    Ok(())
}

fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
