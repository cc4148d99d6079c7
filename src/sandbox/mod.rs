//! Sandbox-side hotplug target
//!
//! Devices never talk to the hypervisor directly. They call into a
//! [`DeviceReceiver`], normally the sandbox that owns the hypervisor handle
//! and the block index allocator. [`HypervisorReceiver`] is the stock
//! implementation: it forwards device descriptors to a [`Hypervisor`] and
//! owns a [`BlockIndexAllocator`].

pub mod block_index;

use std::sync::Arc;

use tracing::{debug, info, warn};

pub use block_index::BlockIndexAllocator;

use crate::devices::{Device, DeviceAttrs, DeviceType};
use crate::hypervisor::{Hypervisor, HypervisorDevice};
use crate::{Error, Result};

/// Target of device hotplug operations.
///
/// Failures of the plug calls are reported as [`Error::HotplugFailure`] naming
/// the device; retry and timeout policy belong to the implementation.
#[async_trait::async_trait]
pub trait DeviceReceiver: Send + Sync {
    /// Hotplug `device` into the running VM.
    async fn hotplug_add_device(&self, device: &dyn Device, device_type: DeviceType) -> Result<()>;

    /// Hot-unplug `device` from the running VM.
    async fn hotplug_remove_device(&self, device: &dyn Device, device_type: DeviceType)
        -> Result<()>;

    /// Add a cold-plugged device to the VM configuration.
    async fn append_device(&self, device: &dyn Device) -> Result<()>;

    /// Claim a block index for a new block device.
    fn get_and_set_sandbox_block_index(&self) -> Result<u32>;

    /// Give `index` back to the sandbox.
    fn decrement_sandbox_block_index(&self, index: u32);
}

/// [`DeviceReceiver`] forwarding to a hypervisor.
pub struct HypervisorReceiver {
    hypervisor: Arc<dyn Hypervisor>,
    block_index: BlockIndexAllocator,
}

impl HypervisorReceiver {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, max_block_index: u32) -> Self {
        Self {
            hypervisor,
            block_index: BlockIndexAllocator::new(max_block_index),
        }
    }

    /// Block indices currently held by attached devices.
    pub fn block_indices(&self) -> Vec<u32> {
        self.block_index.in_use()
    }

    fn descriptor(device: &dyn Device) -> Result<HypervisorDevice<'static>> {
        match device.get_device_info() {
            DeviceAttrs::Block(drive) => Ok(HypervisorDevice::Block(drive)),
            DeviceAttrs::VhostUser(attrs) => Ok(HypervisorDevice::VhostUser(attrs)),
            DeviceAttrs::Vfio(devs) => Ok(HypervisorDevice::Vfio(devs)),
            DeviceAttrs::Generic(_) => Err(Error::Unsupported(format!(
                "generic device {} cannot be hotplugged",
                device.id()
            ))),
        }
    }
}

/// Report a hypervisor failure against `device`. Errors that already name a
/// device pass through.
fn hotplug_error(device: &dyn Device, device_type: DeviceType, e: Error) -> Error {
    let e = match e {
        e @ Error::HotplugFailure { .. } => e,
        other => Error::HotplugFailure {
            id: device.id().to_string(),
            device_type: device_type.to_string(),
            reason: other.to_string(),
        },
    };
    warn!(device = device.id(), %device_type, "hypervisor rejected device: {}", e);
    e
}

#[async_trait::async_trait]
impl DeviceReceiver for HypervisorReceiver {
    async fn hotplug_add_device(&self, device: &dyn Device, device_type: DeviceType) -> Result<()> {
        let descriptor = Self::descriptor(device)?;
        info!(device = device.id(), %device_type, "hotplug add");
        let pci_addr = self
            .hypervisor
            .hotplug_add_device(descriptor)
            .await
            .map_err(|e| hotplug_error(device, device_type, e))?;
        if let Some(addr) = pci_addr {
            debug!(device = device.id(), pci_addr = %addr, "device plugged");
        }
        Ok(())
    }

    async fn hotplug_remove_device(
        &self,
        device: &dyn Device,
        device_type: DeviceType,
    ) -> Result<()> {
        let descriptor = Self::descriptor(device)?;
        info!(device = device.id(), %device_type, "hotplug remove");
        self.hypervisor
            .hotplug_remove_device(descriptor)
            .await
            .map_err(|e| hotplug_error(device, device_type, e))
    }

    async fn append_device(&self, device: &dyn Device) -> Result<()> {
        let descriptor = Self::descriptor(device)?;
        info!(device = device.id(), "cold plug");
        self.hypervisor
            .add_device(descriptor)
            .await
            .map_err(|e| hotplug_error(device, device.device_type(), e))
    }

    fn get_and_set_sandbox_block_index(&self) -> Result<u32> {
        self.block_index.get_and_set()
    }

    fn decrement_sandbox_block_index(&self, index: u32) {
        self.block_index.release(index);
    }
}
