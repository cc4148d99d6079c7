//! Generic (character) devices.
//!
//! These are handed to the container through cgroup rules rather than
//! hotplug, so attach and detach only move the reference count.

use tracing::debug;

use crate::devices::{
    AttachCounter, Device, DeviceAttrs, DeviceInfo, DeviceType, GenericDeviceAttrs,
};
use crate::sandbox::DeviceReceiver;
use crate::Result;
use sandbox_persist::DeviceState;

#[derive(Debug)]
pub struct GenericDevice {
    info: DeviceInfo,
    attrs: GenericDeviceAttrs,
    counter: AttachCounter,
}

impl GenericDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            attrs: GenericDeviceAttrs::default(),
            counter: AttachCounter::new(),
        }
    }

    /// Set the permissions the device node is created with in the guest
    pub fn with_permissions(mut self, file_mode: u32, uid: u32, gid: u32) -> Self {
        self.attrs = GenericDeviceAttrs {
            file_mode,
            uid,
            gid,
        };
        self
    }

    /// Restore from a snapshot whose payload was already validated.
    pub(crate) fn from_snapshot(state: &DeviceState, attrs: &sandbox_persist::GenericDeviceAttrs) -> Self {
        Self {
            info: super::load_device_info(&state.id, &state.dev_info),
            attrs: GenericDeviceAttrs {
                file_mode: attrs.file_mode,
                uid: attrs.uid,
                gid: attrs.gid,
            },
            counter: AttachCounter::new(),
        }
    }
}

#[async_trait::async_trait]
impl Device for GenericDevice {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Generic
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn attach_count(&self) -> u32 {
        self.counter.count()
    }

    fn get_device_info(&self) -> DeviceAttrs {
        DeviceAttrs::Generic(self.attrs)
    }

    async fn attach(&self, _receiver: &dyn DeviceReceiver) -> Result<()> {
        let skip = self.counter.bump(true)?;
        debug!(device = %self.info.id, skip, "attach generic device");
        Ok(())
    }

    async fn detach(&self, _receiver: &dyn DeviceReceiver) -> Result<()> {
        let skip = self.counter.bump(false)?;
        debug!(device = %self.info.id, skip, "detach generic device");
        Ok(())
    }

    fn save(&self) -> DeviceState {
        DeviceState {
            id: self.info.id.clone(),
            device_type: DeviceType::Generic.to_string(),
            dev_info: (&self.info).into(),
            generic_dev: Some(sandbox_persist::GenericDeviceAttrs {
                file_mode: self.attrs.file_mode,
                uid: self.attrs.uid,
                gid: self.attrs.gid,
            }),
            ..Default::default()
        }
    }
}
