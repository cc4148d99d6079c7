//! VFIO groups passed through to the guest.
//!
//! The host path is the group node (`/dev/vfio/<group>`); the member PCI
//! functions are discovered from the IOMMU group in sysfs at attach time.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::devices::{
    AttachCounter, Device, DeviceAttrs, DeviceInfo, DeviceType, UndoList, VfioDev,
};
use crate::sandbox::DeviceReceiver;
use crate::utils::{make_name_id, MAX_DEV_ID_SIZE};
use crate::{Error, Result};
use sandbox_persist::DeviceState;

/// Host path prefix of VFIO group nodes.
pub const VFIO_PATH_PREFIX: &str = "/dev/vfio/";

#[derive(Debug)]
pub struct VfioDevice {
    info: DeviceInfo,
    sysfs_root: PathBuf,
    devs: Mutex<Vec<VfioDev>>,
    counter: AttachCounter,
    op_lock: AsyncMutex<()>,
}

impl VfioDevice {
    pub fn new(info: DeviceInfo, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            info,
            sysfs_root: sysfs_root.into(),
            devs: Mutex::new(Vec::new()),
            counter: AttachCounter::new(),
            op_lock: AsyncMutex::new(()),
        }
    }

    /// Whether `host_path` names a VFIO group.
    pub fn is_vfio_path(host_path: &Path) -> bool {
        host_path
            .to_str()
            .map(|p| p.starts_with(VFIO_PATH_PREFIX) && p.len() > VFIO_PATH_PREFIX.len())
            .unwrap_or(false)
    }

    /// IOMMU group number taken from the host path.
    pub fn group(&self) -> Result<String> {
        self.info
            .host_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Config(format!(
                    "vfio device {} has no group in {}",
                    self.info.id,
                    self.info.host_path.display()
                ))
            })
    }

    /// Group members found at the last attach.
    pub fn devices(&self) -> Vec<VfioDev> {
        match self.devs.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn from_snapshot(
        state: &DeviceState,
        devs: &[sandbox_persist::VFIODev],
        sysfs_root: impl Into<PathBuf>,
    ) -> Self {
        let devs = devs
            .iter()
            .map(|d| VfioDev {
                id: d.id.clone(),
                bdf: d.bdf.clone(),
                sysfs_dev: PathBuf::from(&d.sysfs_dev),
            })
            .collect();
        Self {
            info: super::load_device_info(&state.id, &state.dev_info),
            sysfs_root: sysfs_root.into(),
            devs: Mutex::new(devs),
            counter: AttachCounter::new(),
            op_lock: AsyncMutex::new(()),
        }
    }

    /// Read the members of the IOMMU group, sorted by sysfs name.
    fn discover(&self) -> Result<Vec<VfioDev>> {
        let group = self.group()?;
        let devices_dir = self
            .sysfs_root
            .join("kernel/iommu_groups")
            .join(&group)
            .join("devices");

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&devices_dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        if names.is_empty() {
            return Err(Error::Config(format!(
                "iommu group {} has no devices",
                group
            )));
        }

        Ok(names
            .into_iter()
            .enumerate()
            .map(|(i, name)| VfioDev {
                id: make_name_id("vfio", &format!("{}{}", self.info.id, i), MAX_DEV_ID_SIZE),
                // Strip the PCI domain: 0000:00:1f.6 -> 00:1f.6
                bdf: name
                    .split_once(':')
                    .map(|(_, rest)| rest.to_string())
                    .unwrap_or_else(|| name.clone()),
                sysfs_dev: devices_dir.join(&name),
            })
            .collect())
    }

    fn set_devices(&self, devs: Vec<VfioDev>) -> Result<()> {
        let mut guard = self
            .devs
            .lock()
            .map_err(|_| Error::InvalidState("vfio device list lock poisoned".into()))?;
        *guard = devs;
        Ok(())
    }

    async fn plug(&self, receiver: &dyn DeviceReceiver) -> Result<()> {
        let devs = self.discover()?;
        debug!(device = %self.info.id, members = devs.len(), "vfio group discovered");
        self.set_devices(devs)?;

        if self.info.cold_plug {
            info!(device = %self.info.host_path.display(), "Cold plugging {} device", DeviceType::Vfio);
            receiver.append_device(self).await
        } else {
            info!(device = %self.info.host_path.display(), "Attaching {} device", DeviceType::Vfio);
            receiver.hotplug_add_device(self, DeviceType::Vfio).await
        }
    }
}

#[async_trait::async_trait]
impl Device for VfioDevice {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Vfio
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn attach_count(&self) -> u32 {
        self.counter.count()
    }

    fn get_device_info(&self) -> DeviceAttrs {
        DeviceAttrs::Vfio(self.devices())
    }

    async fn attach(&self, receiver: &dyn DeviceReceiver) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.counter.bump(true)? {
            return Ok(());
        }

        let previous = self.devices();
        let undo = UndoList::after_bump();
        if let Err(e) = self.plug(receiver).await {
            warn!(device = %self.info.id, device_type = %DeviceType::Vfio, "attach failed: {}", e);
            undo.unwind(&self.info.id, &self.counter, receiver);
            self.set_devices(previous)?;
            return Err(e);
        }
        Ok(())
    }

    async fn detach(&self, receiver: &dyn DeviceReceiver) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.counter.bump(false)? {
            return Ok(());
        }

        // Cold-plugged devices stay in the VM configuration until shutdown.
        if self.info.cold_plug {
            return Ok(());
        }

        info!(device = %self.info.host_path.display(), "Detaching {} device", DeviceType::Vfio);
        if let Err(e) = receiver.hotplug_remove_device(self, DeviceType::Vfio).await {
            warn!(device = %self.info.id, "hot-unplug failed, keeping device attached: {}", e);
            self.counter.bump(true)?;
            return Err(e);
        }
        Ok(())
    }

    fn save(&self) -> DeviceState {
        let devs = self
            .devices()
            .into_iter()
            .map(|d| sandbox_persist::VFIODev {
                id: d.id,
                bdf: d.bdf,
                sysfs_dev: d.sysfs_dev.to_string_lossy().into_owned(),
            })
            .collect();
        DeviceState {
            id: self.info.id.clone(),
            device_type: DeviceType::Vfio.to_string(),
            dev_info: (&self.info).into(),
            vfio_devs: Some(devs),
            ..Default::default()
        }
    }
}
