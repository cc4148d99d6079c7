//! veth endpoints, the default for container networks.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::hypervisor::{Hypervisor, HypervisorDevice};
use crate::network::{
    detach_pair, Endpoint, EndpointType, HostNetwork, NetInterworkingModel, NetworkInterfacePair,
    NetworkProperties,
};
use crate::Result;
use sandbox_persist::NetworkEndpoint;

#[derive(Debug)]
pub struct VethEndpoint {
    pair: NetworkInterfacePair,
    properties: NetworkProperties,
    pci_addr: String,
    host: Arc<dyn HostNetwork>,
}

impl VethEndpoint {
    pub fn new(
        idx: i32,
        if_name: &str,
        model: NetInterworkingModel,
        host: Arc<dyn HostNetwork>,
    ) -> Result<Self> {
        Ok(Self {
            pair: NetworkInterfacePair::new(idx, if_name, model)?,
            properties: NetworkProperties::default(),
            pci_addr: String::new(),
            host,
        })
    }

    pub(crate) fn from_snapshot(
        saved: &NetworkEndpoint,
        pair: NetworkInterfacePair,
        host: Arc<dyn HostNetwork>,
    ) -> Self {
        Self {
            pair,
            properties: (&saved.properties).into(),
            pci_addr: saved.pci_addr.clone(),
            host,
        }
    }
}

#[async_trait::async_trait]
impl Endpoint for VethEndpoint {
    fn properties(&self) -> &NetworkProperties {
        &self.properties
    }

    fn name(&self) -> &str {
        &self.pair.virt_iface.name
    }

    fn hardware_addr(&self) -> &str {
        &self.pair.tap.tap_iface.hardware_addr
    }

    fn endpoint_type(&self) -> EndpointType {
        EndpointType::Veth
    }

    fn pci_addr(&self) -> &str {
        &self.pci_addr
    }

    fn network_pair(&self) -> Option<&NetworkInterfacePair> {
        Some(&self.pair)
    }

    fn set_properties(&mut self, properties: NetworkProperties) {
        self.properties = properties;
    }

    fn set_pci_addr(&mut self, pci_addr: String) {
        self.pci_addr = pci_addr;
    }

    async fn attach(&mut self, h: &dyn Hypervisor) -> Result<()> {
        let cfg = h.hypervisor_config();
        if let Err(e) = self
            .host
            .connect_vm_network(&mut self.pair, cfg.num_vcpus, cfg.disable_vhost_net)
            .await
        {
            warn!(endpoint = %self.pair.virt_iface.name, "Error bridging virtual endpoint: {}", e);
            return Err(e);
        }

        h.add_device(HypervisorDevice::net(&*self)).await
    }

    async fn detach(&mut self, netns_created: bool, netns_path: &str) -> Result<()> {
        detach_pair(
            self.host.as_ref(),
            &self.pair,
            EndpointType::Veth,
            netns_created,
            netns_path,
        )
        .await
    }

    async fn hot_attach(&mut self, h: &dyn Hypervisor) -> Result<()> {
        let cfg = h.hypervisor_config();
        if let Err(e) = self
            .host
            .connect_vm_network(&mut self.pair, cfg.num_vcpus, cfg.disable_vhost_net)
            .await
        {
            warn!(endpoint = %self.pair.virt_iface.name, "Error bridging virtual endpoint: {}", e);
            return Err(e);
        }

        match h.hotplug_add_device(HypervisorDevice::net(&*self)).await {
            Ok(pci_addr) => {
                if let Some(addr) = pci_addr {
                    self.pci_addr = addr;
                }
                info!(endpoint = %self.pair.virt_iface.name, pci_addr = %self.pci_addr, "veth hot-attached");
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %self.pair.virt_iface.name, "Error attaching virtual endpoint: {}", e);
                if let Err(de) = self
                    .host
                    .disconnect_vm_network(&self.pair, Path::new(""))
                    .await
                {
                    warn!(endpoint = %self.pair.virt_iface.name, "disconnect after failed hotplug: {}", de);
                }
                Err(e)
            }
        }
    }

    async fn hot_detach(
        &mut self,
        h: &dyn Hypervisor,
        netns_created: bool,
        netns_path: &str,
    ) -> Result<()> {
        if !netns_created {
            return Ok(());
        }

        if let Err(e) = self
            .host
            .disconnect_vm_network(&self.pair, Path::new(netns_path))
            .await
        {
            warn!(endpoint = %self.pair.virt_iface.name, "Error un-bridging virtual endpoint: {}", e);
        }

        if let Err(e) = h.hotplug_remove_device(HypervisorDevice::net(&*self)).await {
            warn!(endpoint = %self.pair.virt_iface.name, "Error detaching virtual endpoint: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn save(&self) -> NetworkEndpoint {
        NetworkEndpoint {
            endpoint_type: EndpointType::Veth.to_string(),
            properties: (&self.properties).into(),
            pci_addr: self.pci_addr.clone(),
            veth: Some(sandbox_persist::VethEndpoint {
                net_pair: (&self.pair).into(),
            }),
            ..Default::default()
        }
    }
}
