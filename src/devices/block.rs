//! Block devices hotplugged into the sandbox.
//!
//! The drive name the guest sees depends on the block driver and the
//! sandbox block index, so the index is claimed before the hotplug call and
//! released after the hot-unplug. A restored drive starts unbound: its
//! recorded index is dropped and a fresh one is claimed on the next attach.

use std::sync::Mutex;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::{BlockDriver, BLOCK_DRIVER_OPTION};
use crate::devices::{
    AttachCounter, BlockDrive, Device, DeviceAttrs, DeviceInfo, DeviceType, UndoList, UndoStep,
};
use crate::sandbox::DeviceReceiver;
use crate::utils::{make_name_id, scsi_address, virt_drive_name, MAX_DEV_ID_SIZE};
use crate::{Error, Result};
use sandbox_persist::DeviceState;

#[derive(Debug)]
pub struct BlockDevice {
    info: DeviceInfo,
    drive: Mutex<BlockDrive>,
    counter: AttachCounter,
    /// Held across a whole attach or detach, hotplug call included.
    op_lock: AsyncMutex<()>,
}

impl BlockDevice {
    pub fn new(info: DeviceInfo) -> Self {
        let drive = BlockDrive {
            file: info.host_path.clone(),
            format: "raw".into(),
            id: make_name_id("drive", &info.id, MAX_DEV_ID_SIZE),
            index: None,
            scsi_addr: None,
            virt_path: None,
            pmem: false,
        };
        Self {
            info,
            drive: Mutex::new(drive),
            counter: AttachCounter::new(),
            op_lock: AsyncMutex::new(()),
        }
    }

    /// Driver selected through the `block-driver` option (virtio-scsi if unset).
    pub fn block_driver(&self) -> Result<BlockDriver> {
        match self.info.driver_options.get(BLOCK_DRIVER_OPTION) {
            Some(driver) => driver.parse(),
            None => Ok(BlockDriver::default()),
        }
    }

    /// Current drive descriptor.
    pub fn drive(&self) -> BlockDrive {
        match self.drive.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn from_snapshot(state: &DeviceState, drive: &sandbox_persist::BlockDrive) -> Self {
        // Index, SCSI address and guest path are not restored.
        let drive = BlockDrive {
            file: drive.file.clone().into(),
            format: drive.format.clone(),
            id: drive.id.clone(),
            ..Default::default()
        };
        Self {
            info: super::load_device_info(&state.id, &state.dev_info),
            drive: Mutex::new(drive),
            counter: AttachCounter::new(),
            op_lock: AsyncMutex::new(()),
        }
    }

    fn set_drive(&self, drive: BlockDrive) -> Result<()> {
        let mut guard = self
            .drive
            .lock()
            .map_err(|_| Error::InvalidState("block drive lock poisoned".into()))?;
        *guard = drive;
        Ok(())
    }

    /// Drive descriptor for `index` under the configured driver.
    fn build_drive(&self, index: u32) -> Result<BlockDrive> {
        let mut drive = unbound(self.drive());
        drive.file = self.info.host_path.clone();
        drive.index = Some(index);

        match self.block_driver()? {
            BlockDriver::VirtioScsi => drive.scsi_addr = Some(scsi_address(index)?),
            BlockDriver::VirtioBlk => {
                drive.virt_path = Some(format!("/dev/{}", virt_drive_name(index)?));
            }
            // The VM rootfs sits at /dev/vda and consumes the first name.
            BlockDriver::VirtioMmio => {
                drive.virt_path = Some(format!("/dev/{}", virt_drive_name(index + 1)?));
            }
            BlockDriver::Nvdimm => drive.pmem = true,
        }
        Ok(drive)
    }

    async fn plug(&self, receiver: &dyn DeviceReceiver, undo: &mut UndoList) -> Result<()> {
        let index = receiver.get_and_set_sandbox_block_index()?;
        undo.push(UndoStep::BlockIndex(index));

        let drive = self.build_drive(index)?;
        info!(
            device = %self.info.host_path.display(),
            index,
            "Attaching {} device",
            DeviceType::Block
        );
        self.set_drive(drive)?;
        receiver.hotplug_add_device(self, DeviceType::Block).await
    }
}

/// `drive` with everything derived from a block index cleared.
fn unbound(drive: BlockDrive) -> BlockDrive {
    BlockDrive {
        index: None,
        scsi_addr: None,
        virt_path: None,
        pmem: false,
        ..drive
    }
}

#[async_trait::async_trait]
impl Device for BlockDevice {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Block
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn attach_count(&self) -> u32 {
        self.counter.count()
    }

    fn get_device_info(&self) -> DeviceAttrs {
        DeviceAttrs::Block(self.drive())
    }

    async fn attach(&self, receiver: &dyn DeviceReceiver) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.counter.bump(true)? {
            return Ok(());
        }

        let mut undo = UndoList::after_bump();
        if let Err(e) = self.plug(receiver, &mut undo).await {
            warn!(device = %self.info.id, device_type = %DeviceType::Block, "attach failed: {}", e);
            undo.unwind(&self.info.id, &self.counter, receiver);
            self.set_drive(unbound(self.drive()))?;
            return Err(e);
        }
        Ok(())
    }

    async fn detach(&self, receiver: &dyn DeviceReceiver) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.counter.bump(false)? {
            return Ok(());
        }

        info!(device = %self.info.host_path.display(), "Detaching {} device", DeviceType::Block);
        if let Err(e) = receiver.hotplug_remove_device(self, DeviceType::Block).await {
            warn!(device = %self.info.id, "hot-unplug failed, keeping device attached: {}", e);
            self.counter.bump(true)?;
            return Err(e);
        }

        let drive = self.drive();
        if let Some(index) = drive.index {
            receiver.decrement_sandbox_block_index(index);
        }
        self.set_drive(unbound(drive))
    }

    fn save(&self) -> DeviceState {
        let drive = self.drive();
        DeviceState {
            id: self.info.id.clone(),
            device_type: DeviceType::Block.to_string(),
            dev_info: (&self.info).into(),
            block_drive: Some(sandbox_persist::BlockDrive {
                file: drive.file.to_string_lossy().into_owned(),
                format: drive.format,
                id: drive.id,
                index: drive.index,
                scsi_addr: drive.scsi_addr.unwrap_or_default(),
                virt_path: drive.virt_path.unwrap_or_default(),
                pmem: drive.pmem,
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(driver: Option<&str>) -> BlockDevice {
        let mut info = DeviceInfo::new("rootfs", "/dev/loop3").block(7, 3);
        if let Some(d) = driver {
            info = info.driver_option(BLOCK_DRIVER_OPTION, d);
        }
        BlockDevice::new(info)
    }

    #[test]
    fn test_scsi_is_default() {
        let drive = device(None).build_drive(257).unwrap();
        assert_eq!(drive.scsi_addr.as_deref(), Some("1:1"));
        assert_eq!(drive.virt_path, None);
        assert_eq!(drive.index, Some(257));
        assert_eq!(drive.id, "drive-rootfs");
    }

    #[test]
    fn test_virtio_blk_names() {
        let drive = device(Some("virtio-blk")).build_drive(1).unwrap();
        assert_eq!(drive.virt_path.as_deref(), Some("/dev/vdb"));
        assert_eq!(drive.scsi_addr, None);
    }

    #[test]
    fn test_virtio_mmio_skips_rootfs_name() {
        let drive = device(Some("virtio-mmio")).build_drive(0).unwrap();
        assert_eq!(drive.virt_path.as_deref(), Some("/dev/vdb"));
    }

    #[test]
    fn test_nvdimm_sets_pmem() {
        let drive = device(Some("nvdimm")).build_drive(0).unwrap();
        assert!(drive.pmem);
        assert_eq!(drive.virt_path, None);
    }

    #[test]
    fn test_restored_drive_is_unbound() {
        let dev = device(Some("nvdimm"));
        dev.set_drive(dev.build_drive(4).unwrap()).unwrap();
        let state = dev.save();
        assert_eq!(state.block_drive.as_ref().unwrap().index, Some(4));

        let restored = BlockDevice::from_snapshot(&state, state.block_drive.as_ref().unwrap());
        let drive = restored.drive();
        assert_eq!(drive.index, None);
        assert!(!drive.pmem);
        assert_eq!(drive.id, "drive-rootfs");
        assert_eq!(drive.file, std::path::PathBuf::from("/dev/loop3"));
    }

    #[test]
    fn test_unknown_driver_rejected() {
        assert!(matches!(
            device(Some("ide")).build_drive(0),
            Err(Error::UnknownType { .. })
        ));
    }
}
