//! Bare tap endpoints created for the sandbox.
//!
//! There is no interface in the namespace to pair with, so a tap endpoint can
//! only be hot-attached to a running VM.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::hypervisor::{Hypervisor, HypervisorDevice};
use crate::network::{
    unsupported, Endpoint, EndpointType, HostNetwork, NetworkInterface, NetworkProperties,
    TapInterface,
};
use crate::Result;
use sandbox_persist::NetworkEndpoint;

#[derive(Debug)]
pub struct TapEndpoint {
    tap: TapInterface,
    properties: NetworkProperties,
    pci_addr: String,
    host: Arc<dyn HostNetwork>,
}

impl TapEndpoint {
    /// Tap `tap{idx}_kata` exposed to the guest as `eth{idx}` (or `if_name`).
    pub fn new(idx: i32, if_name: &str, host: Arc<dyn HostNetwork>) -> Self {
        let name = if if_name.is_empty() {
            format!("eth{}", idx)
        } else {
            if_name.to_string()
        };
        Self {
            tap: TapInterface {
                id: uuid::Uuid::now_v7().to_string(),
                name,
                tap_iface: NetworkInterface {
                    name: format!("tap{}_kata", idx),
                    ..Default::default()
                },
            },
            properties: NetworkProperties::default(),
            pci_addr: String::new(),
            host,
        }
    }

    pub fn tap_interface(&self) -> &TapInterface {
        &self.tap
    }

    pub(crate) fn from_snapshot(
        saved: &NetworkEndpoint,
        tap: TapInterface,
        host: Arc<dyn HostNetwork>,
    ) -> Self {
        Self {
            tap,
            properties: (&saved.properties).into(),
            pci_addr: saved.pci_addr.clone(),
            host,
        }
    }
}

#[async_trait::async_trait]
impl Endpoint for TapEndpoint {
    fn properties(&self) -> &NetworkProperties {
        &self.properties
    }

    fn name(&self) -> &str {
        &self.tap.name
    }

    fn hardware_addr(&self) -> &str {
        &self.tap.tap_iface.hardware_addr
    }

    fn endpoint_type(&self) -> EndpointType {
        EndpointType::Tap
    }

    fn pci_addr(&self) -> &str {
        &self.pci_addr
    }

    fn set_properties(&mut self, properties: NetworkProperties) {
        self.properties = properties;
    }

    fn set_pci_addr(&mut self, pci_addr: String) {
        self.pci_addr = pci_addr;
    }

    async fn attach(&mut self, _h: &dyn Hypervisor) -> Result<()> {
        Err(unsupported(EndpointType::Tap, "attach before boot"))
    }

    async fn detach(&mut self, netns_created: bool, netns_path: &str) -> Result<()> {
        if !netns_created && !netns_path.is_empty() {
            return Ok(());
        }

        info!(endpoint = %self.tap.name, endpoint_type = %EndpointType::Tap, "Detaching endpoint");
        self.host
            .remove_tap(&self.tap.tap_iface.name, Path::new(netns_path))
            .await
    }

    async fn hot_attach(&mut self, h: &dyn Hypervisor) -> Result<()> {
        let cfg = h.hypervisor_config();
        if let Err(e) = self
            .host
            .create_tap(&mut self.tap, cfg.num_vcpus, cfg.disable_vhost_net)
            .await
        {
            warn!(endpoint = %self.tap.name, "Error bridging tap endpoint: {}", e);
            return Err(e);
        }

        match h.hotplug_add_device(HypervisorDevice::net(&*self)).await {
            Ok(pci_addr) => {
                if let Some(addr) = pci_addr {
                    self.pci_addr = addr;
                }
                info!(endpoint = %self.tap.name, pci_addr = %self.pci_addr, "tap hot-attached");
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %self.tap.name, "Error attaching tap endpoint: {}", e);
                if let Err(re) = self
                    .host
                    .remove_tap(&self.tap.tap_iface.name, Path::new(""))
                    .await
                {
                    warn!(endpoint = %self.tap.name, "remove tap after failed hotplug: {}", re);
                }
                Err(e)
            }
        }
    }

    async fn hot_detach(
        &mut self,
        h: &dyn Hypervisor,
        _netns_created: bool,
        netns_path: &str,
    ) -> Result<()> {
        if let Err(e) = self
            .host
            .remove_tap(&self.tap.tap_iface.name, Path::new(netns_path))
            .await
        {
            warn!(endpoint = %self.tap.name, "Error un-bridging tap endpoint: {}", e);
        }

        if let Err(e) = h.hotplug_remove_device(HypervisorDevice::net(&*self)).await {
            warn!(endpoint = %self.tap.name, "Error detaching tap endpoint: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn save(&self) -> NetworkEndpoint {
        NetworkEndpoint {
            endpoint_type: EndpointType::Tap.to_string(),
            properties: (&self.properties).into(),
            pci_addr: self.pci_addr.clone(),
            tap: Some(sandbox_persist::TapEndpoint {
                tap_interface: (&self.tap).into(),
            }),
            ..Default::default()
        }
    }
}
