//! Registry of the devices known to one sandbox.
//!
//! Containers of a sandbox that reference the same host device share one
//! [`Device`]; its attach counter decides when the real hotplug happens.

use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::config::{HotplugConfig, BLOCK_DRIVER_OPTION};
use crate::devices::{
    BlockDevice, Device, DeviceInfo, GenericDevice, VfioDevice, VhostUserBlkDevice,
    VHOST_USER_BLK_MAJOR,
};
use crate::persistence;
use crate::sandbox::DeviceReceiver;
use crate::{Error, Result};
use sandbox_persist::DeviceState;

pub struct DeviceManager {
    config: HotplugConfig,
    devices: RwLock<Vec<Arc<dyn Device>>>,
}

impl DeviceManager {
    pub fn new(config: HotplugConfig) -> Self {
        Self {
            config,
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Rebuild a registry from a snapshot. No device is attached afterwards.
    pub fn load(config: HotplugConfig, states: &[DeviceState]) -> Result<Self> {
        let devices = states
            .iter()
            .map(|state| persistence::load_device(state, &config))
            .collect::<Result<Vec<_>>>()?;
        debug!(count = devices.len(), "devices restored");
        Ok(Self {
            config,
            devices: RwLock::new(devices),
        })
    }

    pub fn config(&self) -> &HotplugConfig {
        &self.config
    }

    /// Create a device for `info`, or return the existing device for the same
    /// host node.
    pub fn new_device(&self, mut info: DeviceInfo) -> Result<Arc<dyn Device>> {
        if info.host_path.as_os_str().is_empty() {
            return Err(Error::Config("device host path is empty".into()));
        }

        let mut devices = self
            .devices
            .write()
            .map_err(|_| Error::InvalidState("device registry lock poisoned".into()))?;

        if let Some(existing) = devices.iter().find(|d| same_node(d.device_info(), &info)) {
            debug!(device = existing.id(), "reusing existing device");
            return Ok(Arc::clone(existing));
        }

        if info.id.is_empty() {
            info.id = uuid::Uuid::now_v7().simple().to_string();
        } else if devices.iter().any(|d| d.id() == info.id) {
            return Err(Error::Config(format!("device id {} already in use", info.id)));
        }

        let device: Arc<dyn Device> = if VfioDevice::is_vfio_path(&info.host_path) {
            Arc::new(VfioDevice::new(info, self.config.sysfs_root.clone()))
        } else if info.dev_type == "b" && info.major == VHOST_USER_BLK_MAJOR {
            Arc::new(VhostUserBlkDevice::new(info))
        } else if info.dev_type == "b" {
            info.driver_options
                .entry(BLOCK_DRIVER_OPTION.to_string())
                .or_insert_with(|| self.config.block_driver.to_string());
            Arc::new(BlockDevice::new(info))
        } else {
            Arc::new(GenericDevice::new(info))
        };

        info!(device = device.id(), device_type = %device.device_type(), "device created");
        devices.push(Arc::clone(&device));
        Ok(device)
    }

    pub fn find_device(&self, id: &str) -> Option<Arc<dyn Device>> {
        let devices = self.devices.read().ok()?;
        devices.iter().find(|d| d.id() == id).cloned()
    }

    /// All devices in creation order.
    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        match self.devices.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn attach_device(&self, id: &str, receiver: &dyn DeviceReceiver) -> Result<()> {
        let device = self.lookup(id)?;
        device.attach(receiver).await
    }

    pub async fn detach_device(&self, id: &str, receiver: &dyn DeviceReceiver) -> Result<()> {
        let device = self.lookup(id)?;
        device.detach(receiver).await
    }

    pub fn is_device_attached(&self, id: &str) -> Result<bool> {
        Ok(self.lookup(id)?.attach_count() > 0)
    }

    /// Drop a device from the registry. Fails while it is still attached.
    pub fn remove_device(&self, id: &str) -> Result<Arc<dyn Device>> {
        let mut devices = self
            .devices
            .write()
            .map_err(|_| Error::InvalidState("device registry lock poisoned".into()))?;
        let pos = devices
            .iter()
            .position(|d| d.id() == id)
            .ok_or_else(|| Error::InvalidState(format!("device {} not found", id)))?;

        let count = devices[pos].attach_count();
        if count > 0 {
            return Err(Error::InvalidState(format!(
                "device {} is still attached ({} holders)",
                id, count
            )));
        }
        Ok(devices.remove(pos))
    }

    /// Snapshot every device in creation order.
    pub fn save(&self) -> Vec<DeviceState> {
        self.devices().iter().map(|d| d.save()).collect()
    }

    fn lookup(&self, id: &str) -> Result<Arc<dyn Device>> {
        self.find_device(id)
            .ok_or_else(|| Error::InvalidState(format!("device {} not found", id)))
    }
}

fn same_node(existing: &DeviceInfo, info: &DeviceInfo) -> bool {
    if existing.host_path == info.host_path {
        return true;
    }
    !info.dev_type.is_empty()
        && existing.dev_type == info.dev_type
        && (info.major, info.minor) != (0, 0)
        && (existing.major, existing.minor) == (info.major, info.minor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockDriver;
    use crate::devices::DeviceType;

    fn manager() -> DeviceManager {
        DeviceManager::new(HotplugConfig::new().block_driver(BlockDriver::VirtioBlk))
    }

    #[test]
    fn test_variant_selection() {
        let m = manager();
        let blk = m
            .new_device(DeviceInfo::new("", "/dev/sdb").block(8, 16))
            .unwrap();
        let vhost = m
            .new_device(DeviceInfo::new("", "/run/vhost/blk.sock").block(VHOST_USER_BLK_MAJOR, 0))
            .unwrap();
        let vfio = m.new_device(DeviceInfo::new("", "/dev/vfio/4")).unwrap();
        let chr = m
            .new_device(DeviceInfo::new("", "/dev/fuse").character(10, 229))
            .unwrap();

        assert_eq!(blk.device_type(), DeviceType::Block);
        assert_eq!(blk.device_info().driver_options[BLOCK_DRIVER_OPTION], "virtio-blk");
        assert_eq!(vhost.device_type(), DeviceType::VhostUserBlk);
        assert_eq!(vfio.device_type(), DeviceType::Vfio);
        assert_eq!(chr.device_type(), DeviceType::Generic);
        assert!(!blk.id().is_empty());
        assert_eq!(m.devices().len(), 4);
    }

    #[test]
    fn test_same_major_minor_is_shared() {
        let m = manager();
        let a = m
            .new_device(DeviceInfo::new("a", "/dev/sdb").block(8, 16))
            .unwrap();
        let b = m
            .new_device(DeviceInfo::new("b", "/dev/disk/by-id/x").block(8, 16))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(m.devices().len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let m = manager();
        m.new_device(DeviceInfo::new("a", "/dev/sdb").block(8, 16))
            .unwrap();
        assert!(matches!(
            m.new_device(DeviceInfo::new("a", "/dev/sdc").block(8, 32)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_empty_host_path_rejected() {
        assert!(matches!(
            manager().new_device(DeviceInfo::new("a", "")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_remove_unattached_device() {
        let m = manager();
        m.new_device(DeviceInfo::new("a", "/dev/fuse").character(10, 229))
            .unwrap();
        assert!(!m.is_device_attached("a").unwrap());
        m.remove_device("a").unwrap();
        assert!(m.find_device("a").is_none());
        assert!(matches!(m.remove_device("a"), Err(Error::InvalidState(_))));
    }
}
