//! VM configuration types.
//!
//! The configuration is stored as `config.json` in the VM home directory.
//! Device paths may be relative to the home directory or absolute; an
//! absolute path outside the home marks an external device.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration file name inside a VM home.
pub const CONFIG_FILE: &str = "config.json";

/// VM info file name inside a VM home.
pub const VM_INFO_FILE: &str = "vminfo.json";

/// Kind of virtual environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    /// Full virtual machine.
    #[default]
    Vm,
    /// Container.
    Ct,
}

/// Guest operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOs {
    /// Linux guest.
    #[default]
    Linux,
    /// Windows guest.
    Windows,
    /// Anything else.
    Other,
}

/// How a hard disk is backed on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskEmulation {
    /// Disk image managed by the disk backend.
    #[default]
    Image,
    /// Pass-through host device or partition.
    RealDevice,
}

fn default_true() -> bool {
    true
}

/// Hard disk device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardDisk {
    /// Device index.
    pub index: u32,
    /// Image or device path.
    pub path: PathBuf,
    /// Whether the device is connected.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Backing type.
    #[serde(default)]
    pub emulation: DiskEmulation,
    /// Pass-through boot camp partition.
    #[serde(default)]
    pub bootcamp: bool,
}

impl HardDisk {
    /// Whether the disk is an enabled image managed by the disk backend.
    pub fn is_active_image(&self) -> bool {
        self.enabled && self.emulation == DiskEmulation::Image
    }
}

/// Image-backed device such as a floppy or a port output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDevice {
    /// Device index.
    pub index: u32,
    /// Image or output file path.
    pub path: PathBuf,
    /// Whether the device is connected.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Network adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAdapter {
    /// Device index.
    pub index: u32,
    /// MAC address as 12 upper-case hex digits.
    pub mac: String,
    /// Host-side interface name.
    #[serde(default)]
    pub host_interface: Option<String>,
    /// Configured IP addresses.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// VM configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// VM uuid.
    pub uuid: String,
    /// VM name.
    pub name: String,
    /// VM or container.
    #[serde(default)]
    pub vm_type: VmType,
    /// Whether this VM is a template.
    #[serde(default)]
    pub template: bool,
    /// Guest OS family.
    #[serde(default)]
    pub guest_os: GuestOs,
    /// Guest RAM in MB.
    pub ram_mb: u64,
    /// Video memory in MB.
    #[serde(default)]
    pub video_mb: u64,
    /// Hard disks.
    #[serde(default)]
    pub hard_disks: Vec<HardDisk>,
    /// Floppy drives.
    #[serde(default)]
    pub floppies: Vec<ImageDevice>,
    /// Serial ports with output files.
    #[serde(default)]
    pub serial_ports: Vec<ImageDevice>,
    /// Parallel ports with output files.
    #[serde(default)]
    pub parallel_ports: Vec<ImageDevice>,
    /// NVRAM file.
    #[serde(default)]
    pub nvram: Option<PathBuf>,
    /// Network adapters.
    #[serde(default)]
    pub net_adapters: Vec<NetAdapter>,
    /// Guest SID must be regenerated on first boot.
    #[serde(default)]
    pub pending_sid_change: bool,
}

impl VmConfig {
    /// Create a minimal configuration.
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, ram_mb: u64) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            vm_type: VmType::Vm,
            template: false,
            guest_os: GuestOs::Linux,
            ram_mb,
            video_mb: 0,
            hard_disks: Vec::new(),
            floppies: Vec::new(),
            serial_ports: Vec::new(),
            parallel_ports: Vec::new(),
            nvram: None,
            net_adapters: Vec::new(),
            pending_sid_change: false,
        }
    }

    /// Load `config.json` from a VM home.
    pub fn load(home: &Path) -> Result<Self> {
        Self::load_from(&home.join(CONFIG_FILE))
    }

    /// Load a configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))
    }

    /// Save as `config.json` in a VM home.
    pub fn save(&self, home: &Path) -> Result<()> {
        self.save_to(&home.join(CONFIG_FILE))
    }

    /// Save to an explicit file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Config(format!("serialize vm config: {}", e)))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Resolve a device path against the VM home.
    pub fn resolve(home: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            home.join(path)
        }
    }

    /// Enabled image disks with their resolved paths.
    pub fn image_disks(&self, home: &Path) -> Vec<(u32, PathBuf)> {
        self.hard_disks
            .iter()
            .filter(|d| d.is_active_image())
            .map(|d| (d.index, Self::resolve(home, &d.path)))
            .collect()
    }

    /// Whether any hard disk is a pass-through boot camp partition.
    pub fn has_bootcamp_device(&self) -> bool {
        self.hard_disks
            .iter()
            .any(|d| d.bootcamp && d.emulation == DiskEmulation::RealDevice)
    }

    /// Memory that a snapshot of this VM needs on disk, in MB.
    pub fn snapshot_footprint_mb(&self) -> u64 {
        self.ram_mb + self.video_mb
    }
}
