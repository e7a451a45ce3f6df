//! VM configuration types.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest accepted RAM size in MiB.
pub const MIN_RAM_MB: u32 = 512;
/// Largest accepted RAM size in MiB.
pub const MAX_RAM_MB: u32 = 8192;
/// Smallest accepted CPU count.
pub const MIN_CPUS: u8 = 1;
/// Largest accepted CPU count.
pub const MAX_CPUS: u8 = 8;

/// Default RAM size in MiB.
pub const DEFAULT_RAM_MB: u32 = 2048;
/// Default CPU count.
pub const DEFAULT_CPUS: u8 = 2;

/// VM resource sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory in MiB.
    pub ram_mb: u32,
    /// Number of vCPUs.
    pub cpus: u8,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            ram_mb: DEFAULT_RAM_MB,
            cpus: DEFAULT_CPUS,
        }
    }
}

impl Resources {
    /// Create resources with the given memory and CPUs.
    pub fn new(ram_mb: u32, cpus: u8) -> Self {
        Self { ram_mb, cpus }
    }

    /// Check both values against the accepted bounds.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_RAM_MB..=MAX_RAM_MB).contains(&self.ram_mb) {
            return Err(Error::invalid_config(format!(
                "ram {} MB outside [{}, {}]",
                self.ram_mb, MIN_RAM_MB, MAX_RAM_MB
            )));
        }
        if !(MIN_CPUS..=MAX_CPUS).contains(&self.cpus) {
            return Err(Error::invalid_config(format!(
                "cpu count {} outside [{}, {}]",
                self.cpus, MIN_CPUS, MAX_CPUS
            )));
        }
        Ok(())
    }
}

/// Transport protocol of a port forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP forward.
    #[default]
    Tcp,
    /// UDP forward.
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Host-to-guest port forward applied by user-mode networking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortForward {
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
    /// Port on the host (bound on all host addresses).
    pub host: u16,
    /// Port inside the guest.
    pub guest: u16,
}

impl PortForward {
    /// Create a TCP forward.
    pub fn tcp(host: u16, guest: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            host,
            guest,
        }
    }

    /// Create a UDP forward.
    pub fn udp(host: u16, guest: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            host,
            guest,
        }
    }

    /// Render in QEMU `hostfwd` syntax: `tcp::HOST-:GUEST`.
    pub fn to_hostfwd(&self) -> String {
        format!("{}::{}-:{}", self.protocol, self.host, self.guest)
    }
}

impl std::str::FromStr for PortForward {
    type Err = String;

    /// Parse `[tcp|udp/]HOST:GUEST` or a single `PORT` (same on both sides).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (protocol, rest) = match s.split_once('/') {
            Some(("tcp", rest)) => (Protocol::Tcp, rest),
            Some(("udp", rest)) => (Protocol::Udp, rest),
            Some((other, _)) => return Err(format!("unknown protocol: {}", other)),
            None => (Protocol::Tcp, s),
        };

        let (host, guest) = match rest.split_once(':') {
            Some((host, guest)) => (host, guest),
            None => (rest, rest),
        };
        let host: u16 = host
            .parse()
            .map_err(|_| format!("invalid host port: {}", host))?;
        let guest: u16 = guest
            .parse()
            .map_err(|_| format!("invalid guest port: {}", guest))?;

        Ok(Self {
            protocol,
            host,
            guest,
        })
    }
}

/// The forwards the Docker host VM ships with: Docker API, SSH, web and HTTPS.
pub fn default_port_forwards() -> Vec<PortForward> {
    vec![
        PortForward::tcp(2375, 2375),
        PortForward::tcp(2222, 22),
        PortForward::tcp(8080, 8080),
        PortForward::tcp(8443, 443),
    ]
}

/// Disk image format for the primary disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// Raw disk image.
    Raw,
    /// QCOW2 format (copy-on-write).
    #[default]
    Qcow2,
}

impl DiskFormat {
    /// Magic bytes at the start of every qcow2 image.
    pub const QCOW2_MAGIC: [u8; 4] = [b'Q', b'F', b'I', 0xfb];

    /// Name used in QEMU `format=` options.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }

    /// Detect the format of an existing image from its header.
    pub fn detect(path: &Path) -> Result<Self> {
        use std::io::Read;

        let mut header = [0u8; 4];
        let mut file = std::fs::File::open(path)?;
        match file.read_exact(&mut header) {
            Ok(()) if header == Self::QCOW2_MAGIC => Ok(DiskFormat::Qcow2),
            Ok(()) => Ok(DiskFormat::Raw),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(DiskFormat::Raw),
            Err(e) => Err(e.into()),
        }
    }
}

/// Complete configuration of one VM launch.
///
/// Built fresh before each start and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Memory and CPU sizing.
    pub resources: Resources,

    /// Primary disk, attached read-write.
    pub disk: PathBuf,

    /// Primary disk format.
    pub disk_format: DiskFormat,

    /// Boot media (ISO), attached read-only.
    pub boot_media: PathBuf,

    /// Port forwards, applied in order.
    pub port_forwards: Vec<PortForward>,

    /// Path of the control socket the VM listens on.
    pub control_socket: PathBuf,
}

impl VmConfig {
    /// Create a builder for VmConfig.
    pub fn builder(disk: impl Into<PathBuf>, boot_media: impl Into<PathBuf>) -> VmConfigBuilder {
        VmConfigBuilder::new(disk.into(), boot_media.into())
    }

    /// Validate the configuration bounds.
    pub fn validate(&self) -> Result<()> {
        self.resources.validate()?;

        if self.control_socket.as_os_str().is_empty() {
            return Err(Error::invalid_config("control socket path is empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for fwd in &self.port_forwards {
            if !seen.insert((fwd.protocol, fwd.host)) {
                return Err(Error::invalid_config(format!(
                    "host port {}/{} forwarded twice",
                    fwd.protocol, fwd.host
                )));
            }
        }

        Ok(())
    }
}

/// Builder for VmConfig.
#[derive(Debug)]
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl VmConfigBuilder {
    fn new(disk: PathBuf, boot_media: PathBuf) -> Self {
        let control_socket = disk
            .parent()
            .map(|p| p.join("qmp.sock"))
            .unwrap_or_else(|| PathBuf::from("qmp.sock"));

        Self {
            config: VmConfig {
                resources: Resources::default(),
                disk,
                disk_format: DiskFormat::default(),
                boot_media,
                port_forwards: Vec::new(),
                control_socket,
            },
        }
    }

    /// Set the memory in MiB.
    pub fn ram(mut self, ram_mb: u32) -> Self {
        self.config.resources.ram_mb = ram_mb;
        self
    }

    /// Set the number of CPUs.
    pub fn cpus(mut self, cpus: u8) -> Self {
        self.config.resources.cpus = cpus;
        self
    }

    /// Set both resource values at once.
    pub fn resources(mut self, resources: Resources) -> Self {
        self.config.resources = resources;
        self
    }

    /// Set the primary disk format.
    pub fn disk_format(mut self, format: DiskFormat) -> Self {
        self.config.disk_format = format;
        self
    }

    /// Add a port forward.
    pub fn forward(mut self, fwd: PortForward) -> Self {
        self.config.port_forwards.push(fwd);
        self
    }

    /// Add several port forwards, keeping their order.
    pub fn forwards(mut self, fwds: impl IntoIterator<Item = PortForward>) -> Self {
        self.config.port_forwards.extend(fwds);
        self
    }

    /// Set the control socket path.
    pub fn control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.control_socket = path.into();
        self
    }

    /// Build the VmConfig.
    pub fn build(self) -> VmConfig {
        self.config
    }
}
