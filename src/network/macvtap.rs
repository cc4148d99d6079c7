//! macvtap endpoints.
//!
//! The VMM reads and writes the macvtap queues directly, so attach only opens
//! the queue fds (plus vhost-net fds) and hands them over. The fds live as
//! long as the endpoint and are never persisted. A rejected attach closes
//! them again.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::hypervisor::{Hypervisor, HypervisorDevice};
use crate::network::{unsupported, Endpoint, EndpointType, HostNetwork, NetworkProperties};
use crate::Result;
use sandbox_persist::NetworkEndpoint;

#[derive(Debug)]
pub struct MacvtapEndpoint {
    properties: NetworkProperties,
    pci_addr: String,
    vm_fds: Vec<OwnedFd>,
    vhost_fds: Vec<OwnedFd>,
    host: Arc<dyn HostNetwork>,
}

impl MacvtapEndpoint {
    pub fn new(host: Arc<dyn HostNetwork>) -> Self {
        Self {
            properties: NetworkProperties::default(),
            pci_addr: String::new(),
            vm_fds: Vec::new(),
            vhost_fds: Vec::new(),
            host,
        }
    }

    /// Number of macvtap queue fds currently held.
    pub fn queue_count(&self) -> usize {
        self.vm_fds.len()
    }

    /// Number of vhost-net fds currently held.
    pub fn vhost_count(&self) -> usize {
        self.vhost_fds.len()
    }

    pub(crate) fn from_snapshot(saved: &NetworkEndpoint, host: Arc<dyn HostNetwork>) -> Self {
        Self {
            properties: (&saved.properties).into(),
            pci_addr: saved.pci_addr.clone(),
            vm_fds: Vec::new(),
            vhost_fds: Vec::new(),
            host,
        }
    }
}

#[async_trait::async_trait]
impl Endpoint for MacvtapEndpoint {
    fn properties(&self) -> &NetworkProperties {
        &self.properties
    }

    fn name(&self) -> &str {
        &self.properties.iface.name
    }

    fn hardware_addr(&self) -> &str {
        &self.properties.iface.hardware_addr
    }

    fn endpoint_type(&self) -> EndpointType {
        EndpointType::Macvtap
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

    async fn attach(&mut self, h: &dyn Hypervisor) -> Result<()> {
        let cfg = h.hypervisor_config();
        let vm_fds = self
            .host
            .create_macvtap_fds(self.properties.iface.index, cfg.num_vcpus)
            .await?;
        let vhost_fds = if cfg.disable_vhost_net {
            Vec::new()
        } else {
            self.host.create_vhost_fds(cfg.num_vcpus).await?
        };
        debug!(
            endpoint = %self.properties.iface.name,
            queues = vm_fds.len(),
            vhost = vhost_fds.len(),
            "macvtap fds opened"
        );
        self.vm_fds = vm_fds;
        self.vhost_fds = vhost_fds;

        let added = h
            .add_device(HypervisorDevice::Net {
                endpoint: &*self,
                vm_fds: self.vm_fds.iter().map(|fd| fd.as_raw_fd()).collect(),
                vhost_fds: self.vhost_fds.iter().map(|fd| fd.as_raw_fd()).collect(),
            })
            .await;
        if let Err(e) = added {
            warn!(endpoint = %self.properties.iface.name, "closing macvtap fds: {}", e);
            self.vm_fds.clear();
            self.vhost_fds.clear();
            return Err(e);
        }
        Ok(())
    }

    async fn detach(&mut self, _netns_created: bool, _netns_path: &str) -> Result<()> {
        Ok(())
    }

    async fn hot_attach(&mut self, _h: &dyn Hypervisor) -> Result<()> {
        Err(unsupported(EndpointType::Macvtap, "hot attach"))
    }

    async fn hot_detach(
        &mut self,
        _h: &dyn Hypervisor,
        _netns_created: bool,
        _netns_path: &str,
    ) -> Result<()> {
        Err(unsupported(EndpointType::Macvtap, "hot detach"))
    }

    fn save(&self) -> NetworkEndpoint {
        NetworkEndpoint {
            endpoint_type: EndpointType::Macvtap.to_string(),
            properties: (&self.properties).into(),
            pci_addr: self.pci_addr.clone(),
            macvtap: Some(sandbox_persist::MacvtapEndpoint {}),
            ..Default::default()
        }
    }
}
