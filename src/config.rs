//! Configuration for sandbox device and network management

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::network::NetInterworkingModel;
use crate::{Error, Result};

/// Driver option key selecting how block devices are presented to the guest.
pub const BLOCK_DRIVER_OPTION: &str = "block-driver";

/// Highest block index a sandbox hands out (SCSI id/lun addressing limit).
pub const DEFAULT_MAX_BLOCK_INDEX: u32 = 65535;

/// How block devices are exposed to the guest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockDriver {
    /// virtio-scsi, addressed by SCSI id:lun
    #[default]
    VirtioScsi,
    /// virtio-blk over PCI, predictable /dev/vdX names
    VirtioBlk,
    /// virtio-blk over MMIO; the VM rootfs takes the first name
    VirtioMmio,
    /// Persistent memory
    Nvdimm,
}

impl BlockDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockDriver::VirtioScsi => "virtio-scsi",
            BlockDriver::VirtioBlk => "virtio-blk",
            BlockDriver::VirtioMmio => "virtio-mmio",
            BlockDriver::Nvdimm => "nvdimm",
        }
    }
}

impl fmt::Display for BlockDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockDriver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "virtio-scsi" => Ok(BlockDriver::VirtioScsi),
            "virtio-blk" => Ok(BlockDriver::VirtioBlk),
            "virtio-mmio" => Ok(BlockDriver::VirtioMmio),
            "nvdimm" => Ok(BlockDriver::Nvdimm),
            other => Err(Error::unknown_type("block driver", other)),
        }
    }
}

/// Configuration shared by the device manager and network registry
#[derive(Debug, Clone)]
pub struct HotplugConfig {
    /// Block device presentation (default: virtio-scsi)
    pub block_driver: BlockDriver,
    /// Highest block index handed out per sandbox
    pub max_block_index: u32,
    /// Interworking model for new network pairs
    pub interworking_model: NetInterworkingModel,
    /// Root of the sysfs tree (default: /sys)
    pub sysfs_root: PathBuf,
    /// Directory searched for `vhostuser_<addr>/vhu.sock` sockets (default: /tmp)
    pub vhost_user_dir: PathBuf,
    /// Directory where sandbox snapshots are written
    pub state_dir: PathBuf,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            block_driver: BlockDriver::default(),
            max_block_index: DEFAULT_MAX_BLOCK_INDEX,
            interworking_model: NetInterworkingModel::default(),
            sysfs_root: PathBuf::from("/sys"),
            vhost_user_dir: PathBuf::from("/tmp"),
            state_dir: default_state_dir(),
        }
    }
}

impl HotplugConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from `SANDBOX_HOTPLUG_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(driver) = std::env::var("SANDBOX_HOTPLUG_BLOCK_DRIVER") {
            config.block_driver = driver.parse()?;
        }
        if let Ok(model) = std::env::var("SANDBOX_HOTPLUG_NET_MODEL") {
            config.interworking_model = model.parse()?;
        }
        Ok(config)
    }

    /// Set the block driver
    pub fn block_driver(mut self, driver: BlockDriver) -> Self {
        self.block_driver = driver;
        self
    }

    /// Set the highest block index
    pub fn max_block_index(mut self, max: u32) -> Self {
        self.max_block_index = max;
        self
    }

    /// Set the interworking model for new network pairs
    pub fn interworking_model(mut self, model: NetInterworkingModel) -> Self {
        self.interworking_model = model;
        self
    }

    /// Set the sysfs root
    pub fn sysfs_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.sysfs_root = path.into();
        self
    }

    /// Set the vhost-user socket search directory
    pub fn vhost_user_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.vhost_user_dir = path.into();
        self
    }

    /// Set the state directory
    pub fn state_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.state_dir = path.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_block_index == 0 {
            return Err(Error::Config("max_block_index must be at least 1".into()));
        }
        if self.max_block_index > DEFAULT_MAX_BLOCK_INDEX {
            return Err(Error::Config(format!(
                "max_block_index {} exceeds addressable limit {}",
                self.max_block_index, DEFAULT_MAX_BLOCK_INDEX
            )));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(Error::Config("state_dir must not be empty".into()));
        }
        Ok(())
    }
}

fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SANDBOX_HOTPLUG_STATE_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/sandbox-hotplug");
    }

    PathBuf::from("/tmp/sandbox-hotplug-state")
}
