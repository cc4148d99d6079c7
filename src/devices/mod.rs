//! Devices attached to a sandbox
//!
//! This module contains the device variants a sandbox can hotplug:
//! - Generic character devices (reference counted, no hotplug payload)
//! - Block devices (virtio-scsi / virtio-blk / virtio-mmio / nvdimm)
//! - vhost-user block devices backed by a userspace socket
//! - VFIO groups passed through to the guest
//!
//! Every variant owns an [`AttachCounter`]; only the first attach and the last
//! detach reach the [`DeviceReceiver`].

pub mod block;
pub mod counter;
pub mod generic;
pub mod manager;
pub mod vfio;
pub mod vhost_user_blk;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, warn};

pub use block::BlockDevice;
pub use counter::AttachCounter;
pub use generic::GenericDevice;
pub use manager::DeviceManager;
pub use vfio::VfioDevice;
pub use vhost_user_blk::VhostUserBlkDevice;

use crate::sandbox::DeviceReceiver;
use crate::{Error, Result};
use sandbox_persist::DeviceState;

/// Major number the kernel assigns to vhost-user-blk placeholder nodes.
pub const VHOST_USER_BLK_MAJOR: i64 = 241;

/// Device type tags understood by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Generic,
    Block,
    Vfio,
    VhostUserBlk,
    VhostUserNet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Generic => "generic",
            DeviceType::Block => "block",
            DeviceType::Vfio => "vfio",
            DeviceType::VhostUserBlk => "vhost-user-blk-pci",
            DeviceType::VhostUserNet => "virtio-net-pci",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generic" => Ok(DeviceType::Generic),
            "block" => Ok(DeviceType::Block),
            "vfio" => Ok(DeviceType::Vfio),
            "vhost-user-blk-pci" => Ok(DeviceType::VhostUserBlk),
            "virtio-net-pci" => Ok(DeviceType::VhostUserNet),
            other => Err(Error::unknown_type("device", other)),
        }
    }
}

/// Configuration a device is created from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Unique within the sandbox
    pub id: String,
    /// Path of the device (or vhost-user socket) on the host
    pub host_path: PathBuf,
    /// Path the container sees
    pub container_path: PathBuf,
    /// "b" block, "c" character, "u" unbuffered character
    pub dev_type: String,
    pub major: i64,
    pub minor: i64,
    /// Plug before boot instead of hotplugging
    pub cold_plug: bool,
    pub driver_options: BTreeMap<String, String>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            host_path: host_path.into(),
            ..Default::default()
        }
    }

    pub fn block(mut self, major: i64, minor: i64) -> Self {
        self.dev_type = "b".into();
        self.major = major;
        self.minor = minor;
        self
    }

    pub fn character(mut self, major: i64, minor: i64) -> Self {
        self.dev_type = "c".into();
        self.major = major;
        self.minor = minor;
        self
    }

    pub fn container_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.container_path = path.into();
        self
    }

    pub fn cold_plug(mut self, cold_plug: bool) -> Self {
        self.cold_plug = cold_plug;
        self
    }

    pub fn driver_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.driver_options.insert(key.into(), value.into());
        self
    }
}

/// Character device permissions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenericDeviceAttrs {
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Block drive descriptor handed to the receiver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDrive {
    pub file: PathBuf,
    pub format: String,
    pub id: String,
    /// Sandbox block index, set while attached
    pub index: Option<u32>,
    pub scsi_addr: Option<String>,
    /// Predicted guest path for virtio-blk drivers
    pub virt_path: Option<String>,
    pub pmem: bool,
}

/// One member of a VFIO group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VfioDev {
    pub id: String,
    /// PCI bus:device.function
    pub bdf: String,
    pub sysfs_dev: PathBuf,
}

/// Vhost-user hotplug descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostUserDeviceAttrs {
    pub dev_id: String,
    pub socket_path: PathBuf,
    pub device_type: DeviceType,
    pub mac_address: String,
}

/// Variant attributes exposed for callers that need wire-level detail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAttrs {
    Generic(GenericDeviceAttrs),
    Block(BlockDrive),
    Vfio(Vec<VfioDev>),
    VhostUser(VhostUserDeviceAttrs),
}

/// A device that can be attached to a sandbox.
///
/// Implementations are shared (`Arc<dyn Device>`) between the containers of a
/// sandbox, so every method takes `&self`. Hotpluggable devices hold an async
/// lock for the whole of `attach` and `detach`, so a second caller waits for
/// the first one's hotplug or unwind to finish before reading the counter.
#[async_trait::async_trait]
pub trait Device: fmt::Debug + Send + Sync {
    /// Identifier, unique within the sandbox.
    fn id(&self) -> &str;

    /// Static type tag of the variant.
    fn device_type(&self) -> DeviceType;

    /// Configuration the device was created from.
    fn device_info(&self) -> &DeviceInfo;

    /// Number of holders currently depending on the device being attached.
    fn attach_count(&self) -> u32;

    /// Variant attributes.
    fn get_device_info(&self) -> DeviceAttrs;

    /// Attach the device. Only the first holder triggers a hotplug; on
    /// failure every side effect is undone before returning.
    async fn attach(&self, receiver: &dyn DeviceReceiver) -> Result<()>;

    /// Detach the device. Only the last holder triggers a hot-unplug.
    async fn detach(&self, receiver: &dyn DeviceReceiver) -> Result<()>;

    /// Snapshot the device.
    fn save(&self) -> DeviceState;
}

/// A compensating action recorded while an attach is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UndoStep {
    /// Give back the attach counter increment.
    AttachCount,
    /// Return a block index to the sandbox.
    BlockIndex(u32),
}

/// Ordered undo list, unwound in reverse on failure.
#[derive(Debug)]
pub(crate) struct UndoList {
    steps: Vec<UndoStep>,
}

impl UndoList {
    /// Start a list whose first step undoes the attach counter bump.
    pub(crate) fn after_bump() -> Self {
        Self {
            steps: vec![UndoStep::AttachCount],
        }
    }

    pub(crate) fn push(&mut self, step: UndoStep) {
        self.steps.push(step);
    }

    pub(crate) fn unwind(self, id: &str, counter: &AttachCounter, receiver: &dyn DeviceReceiver) {
        for step in self.steps.into_iter().rev() {
            match step {
                UndoStep::BlockIndex(index) => {
                    debug!(device = id, index, "releasing block index");
                    receiver.decrement_sandbox_block_index(index);
                }
                UndoStep::AttachCount => {
                    if let Err(e) = counter.bump(false) {
                        warn!(device = id, "attach count rollback failed: {}", e);
                    }
                }
            }
        }
    }
}

impl From<&DeviceInfo> for sandbox_persist::DeviceInfo {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            host_path: info.host_path.to_string_lossy().into_owned(),
            container_path: info.container_path.to_string_lossy().into_owned(),
            dev_type: info.dev_type.clone(),
            major: info.major,
            minor: info.minor,
            cold_plug: info.cold_plug,
            driver_options: info.driver_options.clone(),
        }
    }
}

pub(crate) fn load_device_info(id: &str, saved: &sandbox_persist::DeviceInfo) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        host_path: PathBuf::from(&saved.host_path),
        container_path: PathBuf::from(&saved.container_path),
        dev_type: saved.dev_type.clone(),
        major: saved.major,
        minor: saved.minor,
        cold_plug: saved.cold_plug,
        driver_options: saved.driver_options.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_keywords() {
        for t in [
            DeviceType::Generic,
            DeviceType::Block,
            DeviceType::Vfio,
            DeviceType::VhostUserBlk,
            DeviceType::VhostUserNet,
        ] {
            assert_eq!(t.as_str().parse::<DeviceType>().unwrap(), t);
        }
        assert!(matches!(
            "floppy".parse::<DeviceType>(),
            Err(Error::UnknownType { kind: "device", .. })
        ));
    }

    #[test]
    fn test_device_info_builder() {
        let info = DeviceInfo::new("d0", "/dev/sdb")
            .block(8, 16)
            .container_path("/dev/xvda")
            .driver_option("block-driver", "virtio-blk");
        assert_eq!(info.dev_type, "b");
        assert_eq!((info.major, info.minor), (8, 16));
        assert_eq!(info.driver_options["block-driver"], "virtio-blk");
    }

    #[test]
    fn test_device_info_persist_conversion() {
        let info = DeviceInfo::new("d0", "/dev/sdb").character(10, 200).cold_plug(true);
        let saved = sandbox_persist::DeviceInfo::from(&info);
        assert_eq!(load_device_info("d0", &saved), info);
    }
}
