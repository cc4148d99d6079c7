//! Block devices served by a vhost-user backend over a unix socket.

use std::sync::Mutex;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::devices::{
    AttachCounter, Device, DeviceAttrs, DeviceInfo, DeviceType, UndoList, UndoStep,
    VhostUserDeviceAttrs,
};
use crate::sandbox::DeviceReceiver;
use crate::utils::{make_name_id, MAX_DEV_ID_SIZE};
use crate::{Error, Result};
use sandbox_persist::DeviceState;

#[derive(Debug)]
pub struct VhostUserBlkDevice {
    info: DeviceInfo,
    attrs: Mutex<VhostUserDeviceAttrs>,
    /// Block index held while attached.
    block_index: Mutex<Option<u32>>,
    counter: AttachCounter,
    op_lock: AsyncMutex<()>,
}

impl VhostUserBlkDevice {
    pub fn new(info: DeviceInfo) -> Self {
        let attrs = Self::build_attrs(&info);
        Self {
            info,
            attrs: Mutex::new(attrs),
            block_index: Mutex::new(None),
            counter: AttachCounter::new(),
            op_lock: AsyncMutex::new(()),
        }
    }

    /// Socket of the vhost-user backend.
    pub fn socket_path(&self) -> std::path::PathBuf {
        self.attrs().socket_path
    }

    /// Block index held while attached.
    pub fn block_index(&self) -> Option<u32> {
        match self.block_index.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn from_snapshot(
        state: &DeviceState,
        attrs: &sandbox_persist::VhostUserDeviceAttrs,
    ) -> Result<Self> {
        let device_type = attrs.device_type.parse::<DeviceType>()?;
        if device_type != DeviceType::VhostUserBlk {
            return Err(Error::InconsistentSnapshot(format!(
                "vhost-user-blk device {} carries attributes of type {}",
                state.id, device_type
            )));
        }
        Ok(Self {
            info: super::load_device_info(&state.id, &state.dev_info),
            attrs: Mutex::new(VhostUserDeviceAttrs {
                dev_id: attrs.dev_id.clone(),
                socket_path: attrs.socket_path.clone().into(),
                device_type,
                mac_address: attrs.mac_address.clone(),
            }),
            block_index: Mutex::new(None),
            counter: AttachCounter::new(),
            op_lock: AsyncMutex::new(()),
        })
    }

    fn build_attrs(info: &DeviceInfo) -> VhostUserDeviceAttrs {
        VhostUserDeviceAttrs {
            dev_id: make_name_id("blk", &info.id, MAX_DEV_ID_SIZE),
            socket_path: info.host_path.clone(),
            device_type: DeviceType::VhostUserBlk,
            mac_address: String::new(),
        }
    }

    fn attrs(&self) -> VhostUserDeviceAttrs {
        match self.attrs.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_block_index(&self, index: Option<u32>) -> Result<()> {
        let mut guard = self
            .block_index
            .lock()
            .map_err(|_| Error::InvalidState("block index lock poisoned".into()))?;
        *guard = index;
        Ok(())
    }

    async fn plug(&self, receiver: &dyn DeviceReceiver, undo: &mut UndoList) -> Result<()> {
        // The guest agent predicts the device name from the sandbox block
        // index, so every vhost-user-blk device holds one while attached.
        let index = receiver.get_and_set_sandbox_block_index()?;
        undo.push(UndoStep::BlockIndex(index));

        let attrs = Self::build_attrs(&self.info);
        info!(
            device = %self.info.host_path.display(),
            socket_path = %attrs.socket_path.display(),
            "Attaching {} device",
            DeviceType::VhostUserBlk
        );
        {
            let mut guard = self
                .attrs
                .lock()
                .map_err(|_| Error::InvalidState("vhost-user attrs lock poisoned".into()))?;
            *guard = attrs;
        }
        self.set_block_index(Some(index))?;

        receiver
            .hotplug_add_device(self, DeviceType::VhostUserBlk)
            .await
    }
}

#[async_trait::async_trait]
impl Device for VhostUserBlkDevice {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::VhostUserBlk
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn attach_count(&self) -> u32 {
        self.counter.count()
    }

    fn get_device_info(&self) -> DeviceAttrs {
        DeviceAttrs::VhostUser(self.attrs())
    }

    async fn attach(&self, receiver: &dyn DeviceReceiver) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.counter.bump(true)? {
            return Ok(());
        }

        let mut undo = UndoList::after_bump();
        if let Err(e) = self.plug(receiver, &mut undo).await {
            warn!(
                device = %self.info.id,
                device_type = %DeviceType::VhostUserBlk,
                "attach failed: {}",
                e
            );
            undo.unwind(&self.info.id, &self.counter, receiver);
            self.set_block_index(None)?;
            return Err(e);
        }
        Ok(())
    }

    async fn detach(&self, receiver: &dyn DeviceReceiver) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.counter.bump(false)? {
            return Ok(());
        }

        info!(
            device = %self.info.host_path.display(),
            "Detaching {} device",
            DeviceType::VhostUserBlk
        );
        if let Err(e) = receiver
            .hotplug_remove_device(self, DeviceType::VhostUserBlk)
            .await
        {
            warn!(device = %self.info.id, "hot-unplug failed, keeping device attached: {}", e);
            self.counter.bump(true)?;
            return Err(e);
        }

        if let Some(index) = self.block_index() {
            receiver.decrement_sandbox_block_index(index);
        }
        self.set_block_index(None)
    }

    fn save(&self) -> DeviceState {
        let attrs = self.attrs();
        DeviceState {
            id: self.info.id.clone(),
            device_type: DeviceType::VhostUserBlk.to_string(),
            dev_info: (&self.info).into(),
            vhost_user_dev: Some(sandbox_persist::VhostUserDeviceAttrs {
                dev_id: attrs.dev_id,
                socket_path: attrs.socket_path.to_string_lossy().into_owned(),
                device_type: attrs.device_type.to_string(),
                mac_address: attrs.mac_address,
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_device_info() {
        let dev = VhostUserBlkDevice::new(DeviceInfo::new(
            "0123456789abcdef0123456789abcdef",
            "/run/vhost/blk0.sock",
        ));
        let DeviceAttrs::VhostUser(attrs) = dev.get_device_info() else {
            panic!("expected vhost-user attrs");
        };
        assert_eq!(attrs.dev_id.len(), MAX_DEV_ID_SIZE);
        assert!(attrs.dev_id.starts_with("blk-0123"));
        assert_eq!(attrs.socket_path, std::path::PathBuf::from("/run/vhost/blk0.sock"));
        assert_eq!(attrs.device_type, DeviceType::VhostUserBlk);
        assert_eq!(dev.block_index(), None);
    }

    #[test]
    fn test_snapshot_with_wrong_attr_type_rejected() {
        let dev = VhostUserBlkDevice::new(DeviceInfo::new("b", "/run/vhost/b.sock"));
        let mut state = dev.save();
        if let Some(attrs) = state.vhost_user_dev.as_mut() {
            attrs.device_type = DeviceType::VhostUserNet.to_string();
        }
        let attrs = state.vhost_user_dev.clone().unwrap();
        assert!(matches!(
            VhostUserBlkDevice::from_snapshot(&state, &attrs),
            Err(Error::InconsistentSnapshot(_))
        ));
    }
}
