//! Global dockvm configuration.
//!
//! Persistent user settings: resource defaults, data location, network
//! forwards and supervisor timings. Stored as TOML in the user's config
//! directory; a missing file means all defaults.

use crate::control::{SshTarget, TransportOrder};
use crate::error::{Error, Result};
use crate::storage::{InitOptions, VmLayout, DEFAULT_DISK_SIZE_MB};
use crate::vm::config::{default_port_forwards, PortForward, Resources, DEFAULT_CPUS, DEFAULT_RAM_MB};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and data directories.
const APP_NAME: &str = "dockvm";

/// Config filename inside the app config directory.
const CONFIG_FILENAME: &str = "config.toml";

/// Global dockvm configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockvmConfig {
    /// Configuration format version.
    pub version: u8,

    /// Default memory in MiB.
    pub default_ram_mb: u32,

    /// Default number of vCPUs.
    pub default_cpus: u8,

    /// Data directory override. Defaults to the platform data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Explicit VM binary. Looked up on `$PATH` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qemu_binary: Option<PathBuf>,

    /// Size of a newly created disk in MiB.
    pub disk_size_mb: u64,

    /// Boot media copied into the data directory on initialize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_media_source: Option<PathBuf>,

    /// Host-to-guest port forwards.
    pub port_forwards: Vec<PortForward>,

    /// Guest SSH endpoint (remote-shell transport).
    pub ssh: SshTarget,

    /// Control transport preference.
    pub transport: TransportOrder,

    /// Supervisor timings.
    pub timings: Timings,
}

impl Default for DockvmConfig {
    fn default() -> Self {
        Self {
            version: 1,
            default_ram_mb: DEFAULT_RAM_MB,
            default_cpus: DEFAULT_CPUS,
            data_dir: None,
            qemu_binary: None,
            disk_size_mb: DEFAULT_DISK_SIZE_MB,
            boot_media_source: None,
            port_forwards: default_port_forwards(),
            ssh: SshTarget::default(),
            transport: TransportOrder::default(),
            timings: Timings::default(),
        }
    }
}

impl DockvmConfig {
    /// Path of the config file.
    ///
    /// On Linux: `~/.config/dockvm/config.toml`
    /// On macOS: `~/Library/Application Support/dockvm/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::ConfigLoad("could not determine config directory".into()))?;
        Ok(dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Load configuration from disk.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::ConfigLoad(format!("{}: {}", path.display(), e))),
        };
        toml::from_str(&data).map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let data = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::ConfigSave(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, data)
            .map_err(|e| Error::ConfigSave(format!("{}: {}", path.display(), e)))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))
    }

    /// Data directory in effect.
    ///
    /// On Linux: `~/.local/share/dockvm`
    /// On macOS: `~/Library/Application Support/dockvm`
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let base = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .ok_or_else(|| Error::storage("could not determine data directory"))?;
        Ok(base.join(APP_NAME))
    }

    /// Layout of the VM's persistent state.
    pub fn layout(&self) -> Result<VmLayout> {
        Ok(VmLayout::new(self.data_dir()?))
    }

    /// Options for initializing the layout.
    pub fn init_options(&self) -> InitOptions {
        InitOptions {
            disk_size_mb: self.disk_size_mb,
            boot_media_source: self.boot_media_source.clone(),
            qemu_img: self
                .qemu_binary
                .as_ref()
                .and_then(|q| q.parent())
                .map(|dir| dir.join("qemu-img"))
                .filter(|p| p.is_file()),
        }
    }

    /// Default resources.
    pub fn default_resources(&self) -> Resources {
        Resources::new(self.default_ram_mb, self.default_cpus)
    }

    /// Update the resource defaults after validating them.
    pub fn set_default_resources(&mut self, ram_mb: Option<u32>, cpus: Option<u8>) -> Result<()> {
        let resources = Resources::new(
            ram_mb.unwrap_or(self.default_ram_mb),
            cpus.unwrap_or(self.default_cpus),
        );
        resources.validate()?;
        self.default_ram_mb = resources.ram_mb;
        self.default_cpus = resources.cpus;
        Ok(())
    }
}

/// Supervisor timings. Serialized in human-readable form ("5s", "100ms").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Liveness polling interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long a graceful stop may take before SIGKILL.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Exit polling interval during stop.
    #[serde(with = "humantime_serde")]
    pub stop_poll: Duration,

    /// Pause between the stop and start halves of a restart.
    #[serde(with = "humantime_serde")]
    pub restart_settle: Duration,

    /// Default bound on one control command.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            stop_poll: Duration::from_millis(100),
            restart_settle: Duration::from_secs(2),
            command_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DockvmConfig::default();
        assert_eq!(config.default_resources(), Resources::new(2048, 2));
        assert_eq!(config.port_forwards.len(), 4);
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.timings.poll_interval, Duration::from_secs(5));
        assert_eq!(config.timings.stop_poll, Duration::from_millis(100));
        assert_eq!(config.transport, TransportOrder::QmpFirst);
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DockvmConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, DockvmConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DockvmConfig::default();
        config.set_default_resources(Some(4096), Some(4)).unwrap();
        config.data_dir = Some(dir.path().join("data"));
        config.timings.restart_settle = Duration::from_millis(250);
        config.save_to(&path).unwrap();

        let loaded = DockvmConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("restart_settle = \"250ms\""));
    }

    #[test]
    fn test_config_missing_optional_fields() {
        // Older files may only carry a couple of keys.
        let config: DockvmConfig = toml::from_str(
            r#"
            version = 1
            default_ram_mb = 1024

            [timings]
            poll_interval = "1s"
            "#,
        )
        .unwrap();

        assert_eq!(config.default_ram_mb, 1024);
        assert_eq!(config.default_cpus, DEFAULT_CPUS);
        assert_eq!(config.timings.poll_interval, Duration::from_secs(1));
        assert_eq!(config.timings.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.port_forwards, default_port_forwards());
    }

    #[test]
    fn test_custom_port_forwards() {
        let config: DockvmConfig = toml::from_str(
            r#"
            [[port_forwards]]
            host = 9000
            guest = 9000

            [[port_forwards]]
            protocol = "udp"
            host = 5353
            guest = 53
            "#,
        )
        .unwrap();
        assert_eq!(
            config.port_forwards,
            vec![PortForward::tcp(9000, 9000), PortForward::udp(5353, 53)]
        );
    }

    #[test]
    fn test_invalid_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "default_ram_mb = \"lots\"").unwrap();

        let err = DockvmConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_set_default_resources_validates() {
        let mut config = DockvmConfig::default();
        let err = config.set_default_resources(Some(100), None).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(config.default_ram_mb, DEFAULT_RAM_MB, "unchanged on error");

        config.set_default_resources(None, Some(8)).unwrap();
        assert_eq!(config.default_cpus, 8);
    }

    #[test]
    fn test_explicit_data_dir() {
        let config = DockvmConfig {
            data_dir: Some(PathBuf::from("/srv/dockvm")),
            ..Default::default()
        };
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/srv/dockvm"));
        assert_eq!(
            config.layout().unwrap().disk(),
            PathBuf::from("/srv/dockvm/alpine-disk.img")
        );
    }
}
