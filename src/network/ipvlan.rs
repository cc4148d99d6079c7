//! ipvlan endpoints.
//!
//! ipvlan slaves share the parent's MAC, so bridging does not work; the pair
//! always uses tc redirection.

use std::sync::Arc;

use tracing::warn;

use crate::hypervisor::{Hypervisor, HypervisorDevice};
use crate::network::{
    detach_pair, unsupported, Endpoint, EndpointType, HostNetwork, NetInterworkingModel,
    NetworkInterfacePair, NetworkProperties,
};
use crate::Result;
use sandbox_persist::NetworkEndpoint;

#[derive(Debug)]
pub struct IPVlanEndpoint {
    pair: NetworkInterfacePair,
    properties: NetworkProperties,
    pci_addr: String,
    host: Arc<dyn HostNetwork>,
}

impl IPVlanEndpoint {
    pub fn new(idx: i32, if_name: &str, host: Arc<dyn HostNetwork>) -> Result<Self> {
        Ok(Self {
            pair: NetworkInterfacePair::new(idx, if_name, NetInterworkingModel::TcFilter)?,
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
impl Endpoint for IPVlanEndpoint {
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
        EndpointType::IPVlan
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
            warn!(endpoint = %self.pair.virt_iface.name, "Error bridging ipvlan endpoint: {}", e);
            return Err(e);
        }

        h.add_device(HypervisorDevice::net(&*self)).await
    }

    async fn detach(&mut self, netns_created: bool, netns_path: &str) -> Result<()> {
        detach_pair(
            self.host.as_ref(),
            &self.pair,
            EndpointType::IPVlan,
            netns_created,
            netns_path,
        )
        .await
    }

    async fn hot_attach(&mut self, _h: &dyn Hypervisor) -> Result<()> {
        Err(unsupported(EndpointType::IPVlan, "hot attach"))
    }

    async fn hot_detach(
        &mut self,
        _h: &dyn Hypervisor,
        _netns_created: bool,
        _netns_path: &str,
    ) -> Result<()> {
        Err(unsupported(EndpointType::IPVlan, "hot detach"))
    }

    fn save(&self) -> NetworkEndpoint {
        NetworkEndpoint {
            endpoint_type: EndpointType::IPVlan.to_string(),
            properties: (&self.properties).into(),
            pci_addr: self.pci_addr.clone(),
            ipvlan: Some(sandbox_persist::IPVlanEndpoint {
                net_pair: (&self.pair).into(),
            }),
            ..Default::default()
        }
    }
}
