//! Hypervisor abstraction.
//!
//! This module defines the [`Hypervisor`] trait the device and endpoint layer
//! calls into. The VMM process itself (QEMU, Firecracker, KVM backends) lives
//! behind this trait and is not implemented here.

use std::os::fd::RawFd;

use crate::devices::{BlockDrive, VfioDev, VhostUserDeviceAttrs};
use crate::network::Endpoint;
use crate::Result;

/// Hypervisor settings that shape network device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypervisorConfig {
    /// Number of vCPUs; also the number of queues for multiqueue taps.
    pub num_vcpus: u32,
    /// Do not open vhost-net fds for tap devices.
    pub disable_vhost_net: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            num_vcpus: 1,
            disable_vhost_net: false,
        }
    }
}

/// A device description handed to the hypervisor.
#[derive(Debug)]
pub enum HypervisorDevice<'a> {
    /// A network endpoint, with the tap/macvtap fds the VMM should use.
    Net {
        endpoint: &'a dyn Endpoint,
        vm_fds: Vec<RawFd>,
        vhost_fds: Vec<RawFd>,
    },
    Block(BlockDrive),
    Vfio(Vec<VfioDev>),
    VhostUser(VhostUserDeviceAttrs),
}

impl<'a> HypervisorDevice<'a> {
    /// Network device without pre-opened fds.
    pub fn net(endpoint: &'a dyn Endpoint) -> Self {
        HypervisorDevice::Net {
            endpoint,
            vm_fds: Vec::new(),
            vhost_fds: Vec::new(),
        }
    }

    /// Short kind label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            HypervisorDevice::Net { .. } => "net",
            HypervisorDevice::Block(_) => "block",
            HypervisorDevice::Vfio(_) => "vfio",
            HypervisorDevice::VhostUser(_) => "vhost-user",
        }
    }
}

/// Trait implemented by the VMM control plane.
///
/// `add_device` configures a device before boot; the hotplug calls operate
/// on a running VM and carry their own timeout/retry policy.
#[async_trait::async_trait]
pub trait Hypervisor: Send + Sync {
    /// Settings relevant to device creation.
    fn hypervisor_config(&self) -> HypervisorConfig;

    /// Add a device to the static VM configuration.
    async fn add_device(&self, device: HypervisorDevice<'_>) -> Result<()>;

    /// Hotplug a device into the running VM. Returns the guest PCI address
    /// when the hypervisor assigned one.
    async fn hotplug_add_device(&self, device: HypervisorDevice<'_>) -> Result<Option<String>>;

    /// Hot-unplug a device from the running VM.
    async fn hotplug_remove_device(&self, device: HypervisorDevice<'_>) -> Result<()>;
}
