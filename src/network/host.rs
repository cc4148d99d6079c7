//! Host network plumbing capability.
//!
//! Creating taps, wiring pairs, opening macvtap queues and rebinding PCI
//! functions all go through netlink and sysfs. Endpoints call this trait;
//! the implementation lives with the sandbox runtime.

use std::fmt;
use std::os::fd::OwnedFd;
use std::path::Path;

use crate::network::{NetworkInterfacePair, TapInterface};
use crate::{Error, Result};

#[async_trait::async_trait]
pub trait HostNetwork: fmt::Debug + Send + Sync {
    /// Wire the tap side of `pair` to its virtual interface using the pair's
    /// interworking model. Fills in the tap hardware address.
    async fn connect_vm_network(
        &self,
        pair: &mut NetworkInterfacePair,
        queues: u32,
        disable_vhost_net: bool,
    ) -> Result<()>;

    /// Undo [`HostNetwork::connect_vm_network`] inside `netns`. An empty
    /// `netns` means the current namespace.
    async fn disconnect_vm_network(&self, pair: &NetworkInterfacePair, netns: &Path)
        -> Result<()>;

    /// Create a standalone tap device. Fills in its hardware address.
    async fn create_tap(
        &self,
        tap: &mut TapInterface,
        queues: u32,
        disable_vhost_net: bool,
    ) -> Result<()>;

    /// Delete the tap `name` inside `netns`.
    async fn remove_tap(&self, name: &str, netns: &Path) -> Result<()>;

    /// Open one macvtap queue fd per queue on link `link_index`.
    async fn create_macvtap_fds(&self, link_index: u32, queues: u32) -> Result<Vec<OwnedFd>>;

    /// Open one vhost-net fd per queue.
    async fn create_vhost_fds(&self, queues: u32) -> Result<Vec<OwnedFd>>;

    /// Unbind `bdf` from its host driver and bind it to vfio-pci.
    async fn bind_to_vfio(&self, bdf: &str, vendor_device_id: &str) -> Result<()>;

    /// Give `bdf` back to its original host driver.
    async fn bind_to_host_driver(&self, bdf: &str, driver: &str, vendor_device_id: &str)
        -> Result<()>;
}

/// Host handle for offline inspection of saved state. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineHost;

fn offline(op: &str) -> Error {
    Error::Unsupported(format!("{} needs a live host network", op))
}

#[async_trait::async_trait]
impl HostNetwork for OfflineHost {
    async fn connect_vm_network(
        &self,
        _pair: &mut NetworkInterfacePair,
        _queues: u32,
        _disable_vhost_net: bool,
    ) -> Result<()> {
        Err(offline("connect_vm_network"))
    }

    async fn disconnect_vm_network(
        &self,
        _pair: &NetworkInterfacePair,
        _netns: &Path,
    ) -> Result<()> {
        Err(offline("disconnect_vm_network"))
    }

    async fn create_tap(
        &self,
        _tap: &mut TapInterface,
        _queues: u32,
        _disable_vhost_net: bool,
    ) -> Result<()> {
        Err(offline("create_tap"))
    }

    async fn remove_tap(&self, _name: &str, _netns: &Path) -> Result<()> {
        Err(offline("remove_tap"))
    }

    async fn create_macvtap_fds(&self, _link_index: u32, _queues: u32) -> Result<Vec<OwnedFd>> {
        Err(offline("create_macvtap_fds"))
    }

    async fn create_vhost_fds(&self, _queues: u32) -> Result<Vec<OwnedFd>> {
        Err(offline("create_vhost_fds"))
    }

    async fn bind_to_vfio(&self, _bdf: &str, _vendor_device_id: &str) -> Result<()> {
        Err(offline("bind_to_vfio"))
    }

    async fn bind_to_host_driver(
        &self,
        _bdf: &str,
        _driver: &str,
        _vendor_device_id: &str,
    ) -> Result<()> {
        Err(offline("bind_to_host_driver"))
    }
}
