//! Recording mocks shared by the integration tests.
#![allow(dead_code)]

use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use sandbox_hotplug::devices::{Device, DeviceAttrs, DeviceType};
use sandbox_hotplug::hypervisor::{Hypervisor, HypervisorConfig, HypervisorDevice};
use sandbox_hotplug::network::{HostNetwork, NetworkInterfacePair, TapInterface};
use sandbox_hotplug::sandbox::{BlockIndexAllocator, DeviceReceiver};
use sandbox_hotplug::{Error, Result};

// =============================================================================
// DEVICE RECEIVER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverCall {
    HotplugAdd {
        id: String,
        device_type: DeviceType,
        attrs: DeviceAttrs,
    },
    HotplugRemove {
        id: String,
        device_type: DeviceType,
    },
    Append {
        id: String,
    },
    GetIndex(u32),
    ReleaseIndex(u32),
}

/// Receiver that records every call and fails on demand.
pub struct MockReceiver {
    pub allocator: BlockIndexAllocator,
    calls: Mutex<Vec<ReceiverCall>>,
    pub fail_hotplug_add: AtomicBool,
    pub fail_hotplug_remove: AtomicBool,
}

impl MockReceiver {
    pub fn new() -> Self {
        Self::with_max_index(65535)
    }

    pub fn with_max_index(max: u32) -> Self {
        Self {
            allocator: BlockIndexAllocator::new(max),
            calls: Mutex::new(Vec::new()),
            fail_hotplug_add: AtomicBool::new(false),
            fail_hotplug_remove: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<ReceiverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn hotplug_adds(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ReceiverCall::HotplugAdd { .. }))
            .count()
    }

    pub fn hotplug_removes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ReceiverCall::HotplugRemove { .. }))
            .count()
    }

    fn record(&self, call: ReceiverCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl DeviceReceiver for MockReceiver {
    async fn hotplug_add_device(&self, device: &dyn Device, device_type: DeviceType) -> Result<()> {
        tokio::task::yield_now().await;
        if self.fail_hotplug_add.load(Ordering::SeqCst) {
            return Err(Error::HotplugFailure {
                id: device.id().to_string(),
                device_type: device_type.to_string(),
                reason: "injected".into(),
            });
        }
        self.record(ReceiverCall::HotplugAdd {
            id: device.id().to_string(),
            device_type,
            attrs: device.get_device_info(),
        });
        Ok(())
    }

    async fn hotplug_remove_device(
        &self,
        device: &dyn Device,
        device_type: DeviceType,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        if self.fail_hotplug_remove.load(Ordering::SeqCst) {
            return Err(Error::HotplugFailure {
                id: device.id().to_string(),
                device_type: device_type.to_string(),
                reason: "injected".into(),
            });
        }
        self.record(ReceiverCall::HotplugRemove {
            id: device.id().to_string(),
            device_type,
        });
        Ok(())
    }

    async fn append_device(&self, device: &dyn Device) -> Result<()> {
        self.record(ReceiverCall::Append {
            id: device.id().to_string(),
        });
        Ok(())
    }

    fn get_and_set_sandbox_block_index(&self) -> Result<u32> {
        let index = self.allocator.get_and_set()?;
        self.record(ReceiverCall::GetIndex(index));
        Ok(index)
    }

    fn decrement_sandbox_block_index(&self, index: u32) {
        self.allocator.release(index);
        self.record(ReceiverCall::ReleaseIndex(index));
    }
}

// =============================================================================
// HYPERVISOR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HvCall {
    Add {
        kind: &'static str,
        endpoint: Option<String>,
        vm_fds: usize,
        vhost_fds: usize,
    },
    HotplugAdd {
        kind: &'static str,
        endpoint: Option<String>,
    },
    HotplugRemove {
        kind: &'static str,
        endpoint: Option<String>,
    },
}

pub struct MockHypervisor {
    pub config: HypervisorConfig,
    pub pci_addr: Option<String>,
    calls: Mutex<Vec<HvCall>>,
    pub fail_add: AtomicBool,
    pub fail_hotplug_add: AtomicBool,
    pub fail_hotplug_remove: AtomicBool,
}

impl MockHypervisor {
    pub fn new(num_vcpus: u32) -> Self {
        Self {
            config: HypervisorConfig {
                num_vcpus,
                disable_vhost_net: false,
            },
            pci_addr: Some("02/00".into()),
            calls: Mutex::new(Vec::new()),
            fail_add: AtomicBool::new(false),
            fail_hotplug_add: AtomicBool::new(false),
            fail_hotplug_remove: AtomicBool::new(false),
        }
    }

    pub fn without_vhost_net(mut self) -> Self {
        self.config.disable_vhost_net = true;
        self
    }

    pub fn calls(&self) -> Vec<HvCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn endpoint_name(device: &HypervisorDevice<'_>) -> Option<String> {
    match device {
        HypervisorDevice::Net { endpoint, .. } => Some(endpoint.name().to_string()),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Hypervisor for MockHypervisor {
    fn hypervisor_config(&self) -> HypervisorConfig {
        self.config
    }

    async fn add_device(&self, device: HypervisorDevice<'_>) -> Result<()> {
        let (vm_fds, vhost_fds) = match &device {
            HypervisorDevice::Net {
                vm_fds, vhost_fds, ..
            } => (vm_fds.len(), vhost_fds.len()),
            _ => (0, 0),
        };
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(Error::Network(format!(
                "{} cold-plug failed (injected)",
                device.kind()
            )));
        }
        self.calls.lock().unwrap().push(HvCall::Add {
            kind: device.kind(),
            endpoint: endpoint_name(&device),
            vm_fds,
            vhost_fds,
        });
        Ok(())
    }

    async fn hotplug_add_device(&self, device: HypervisorDevice<'_>) -> Result<Option<String>> {
        if self.fail_hotplug_add.load(Ordering::SeqCst) {
            return Err(Error::HotplugFailure {
                id: endpoint_name(&device).unwrap_or_default(),
                device_type: device.kind().to_string(),
                reason: "injected".into(),
            });
        }
        self.calls.lock().unwrap().push(HvCall::HotplugAdd {
            kind: device.kind(),
            endpoint: endpoint_name(&device),
        });
        Ok(self.pci_addr.clone())
    }

    async fn hotplug_remove_device(&self, device: HypervisorDevice<'_>) -> Result<()> {
        if self.fail_hotplug_remove.load(Ordering::SeqCst) {
            return Err(Error::HotplugFailure {
                id: endpoint_name(&device).unwrap_or_default(),
                device_type: device.kind().to_string(),
                reason: "injected".into(),
            });
        }
        self.calls.lock().unwrap().push(HvCall::HotplugRemove {
            kind: device.kind(),
            endpoint: endpoint_name(&device),
        });
        Ok(())
    }
}

// =============================================================================
// HOST NETWORK
// =============================================================================

pub const TAP_MAC: &str = "02:00:ca:fe:00:01";

#[derive(Debug, Default)]
pub struct MockHostNetwork {
    calls: Mutex<Vec<String>>,
    pub fail_connect: AtomicBool,
    pub fail_disconnect: AtomicBool,
    pub fail_remove_tap: AtomicBool,
}

impl MockHostNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn fds(count: u32) -> Result<Vec<OwnedFd>> {
        let mut fds = Vec::new();
        for _ in 0..count {
            fds.push(OwnedFd::from(File::open("/dev/null")?));
        }
        Ok(fds)
    }
}

fn injected(op: &str) -> Error {
    Error::Network(format!("{} failed (injected)", op))
}

#[async_trait::async_trait]
impl HostNetwork for MockHostNetwork {
    async fn connect_vm_network(
        &self,
        pair: &mut NetworkInterfacePair,
        queues: u32,
        _disable_vhost_net: bool,
    ) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(injected("connect"));
        }
        pair.tap.tap_iface.hardware_addr = TAP_MAC.into();
        self.record(format!("connect {} queues={}", pair.tap.tap_iface.name, queues));
        Ok(())
    }

    async fn disconnect_vm_network(&self, pair: &NetworkInterfacePair, netns: &Path) -> Result<()> {
        self.record(format!(
            "disconnect {} netns={}",
            pair.tap.tap_iface.name,
            netns.display()
        ));
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(injected("disconnect"));
        }
        Ok(())
    }

    async fn create_tap(
        &self,
        tap: &mut TapInterface,
        queues: u32,
        _disable_vhost_net: bool,
    ) -> Result<()> {
        tap.tap_iface.hardware_addr = TAP_MAC.into();
        self.record(format!("create_tap {} queues={}", tap.tap_iface.name, queues));
        Ok(())
    }

    async fn remove_tap(&self, name: &str, netns: &Path) -> Result<()> {
        self.record(format!("remove_tap {} netns={}", name, netns.display()));
        if self.fail_remove_tap.load(Ordering::SeqCst) {
            return Err(injected("remove_tap"));
        }
        Ok(())
    }

    async fn create_macvtap_fds(&self, link_index: u32, queues: u32) -> Result<Vec<OwnedFd>> {
        self.record(format!("macvtap link={} queues={}", link_index, queues));
        Self::fds(queues)
    }

    async fn create_vhost_fds(&self, queues: u32) -> Result<Vec<OwnedFd>> {
        self.record(format!("vhost queues={}", queues));
        Self::fds(queues)
    }

    async fn bind_to_vfio(&self, bdf: &str, vendor_device_id: &str) -> Result<()> {
        self.record(format!("bind_vfio {} {}", bdf, vendor_device_id));
        Ok(())
    }

    async fn bind_to_host_driver(
        &self,
        bdf: &str,
        driver: &str,
        _vendor_device_id: &str,
    ) -> Result<()> {
        self.record(format!("bind_host {} {}", bdf, driver));
        Ok(())
    }
}
