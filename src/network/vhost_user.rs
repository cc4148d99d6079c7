//! vhost-user-net endpoints backed by a userspace switch socket.

use std::path::{Path, PathBuf};

use ipnet::IpNet;
use tracing::info;

use crate::devices::{DeviceType, VhostUserDeviceAttrs};
use crate::hypervisor::{Hypervisor, HypervisorDevice};
use crate::network::{unsupported, Endpoint, EndpointType, NetworkProperties};
use crate::{Error, Result};
use sandbox_persist::NetworkEndpoint;

/// Socket file the switch creates under `vhostuser_<addr>/`.
pub const VHOST_USER_SOCKET_NAME: &str = "vhu.sock";

/// Look for a vhost-user socket published for one of `addrs`.
pub fn find_socket(search_dir: &Path, addrs: &[IpNet]) -> Option<PathBuf> {
    addrs
        .iter()
        .map(|addr| {
            search_dir
                .join(format!("vhostuser_{}", addr.addr()))
                .join(VHOST_USER_SOCKET_NAME)
        })
        .find(|path| path.exists())
}

#[derive(Debug)]
pub struct VhostUserEndpoint {
    iface_name: String,
    hardware_addr: String,
    socket_path: PathBuf,
    properties: NetworkProperties,
    pci_addr: String,
}

impl VhostUserEndpoint {
    pub fn new(
        iface_name: impl Into<String>,
        hardware_addr: impl Into<String>,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            iface_name: iface_name.into(),
            hardware_addr: hardware_addr.into(),
            socket_path: socket_path.into(),
            properties: NetworkProperties::default(),
            pci_addr: String::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub(crate) fn from_snapshot(
        saved: &NetworkEndpoint,
        payload: &sandbox_persist::VhostUserEndpoint,
    ) -> Self {
        Self {
            iface_name: payload.iface_name.clone(),
            hardware_addr: payload.hard_addr.clone(),
            socket_path: PathBuf::from(&payload.socket_path),
            properties: (&saved.properties).into(),
            pci_addr: saved.pci_addr.clone(),
        }
    }
}

/// Random 8-byte hex id for the VMM command line.
fn random_dev_id() -> Result<String> {
    let mut buf = [0u8; 8];
    getrandom::fill(&mut buf)
        .map_err(|e| Error::Network(format!("failed to generate device id: {}", e)))?;
    Ok(buf.iter().map(|b| format!("{:02x}", b)).collect())
}

#[async_trait::async_trait]
impl Endpoint for VhostUserEndpoint {
    fn properties(&self) -> &NetworkProperties {
        &self.properties
    }

    fn name(&self) -> &str {
        &self.iface_name
    }

    fn hardware_addr(&self) -> &str {
        &self.hardware_addr
    }

    fn endpoint_type(&self) -> EndpointType {
        EndpointType::VhostUser
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
        let attrs = VhostUserDeviceAttrs {
            dev_id: random_dev_id()?,
            socket_path: self.socket_path.clone(),
            device_type: DeviceType::VhostUserNet,
            mac_address: self.hardware_addr.clone(),
        };
        info!(
            endpoint = %self.iface_name,
            socket_path = %self.socket_path.display(),
            "Attaching vhost-user endpoint"
        );
        h.add_device(HypervisorDevice::VhostUser(attrs)).await
    }

    async fn detach(&mut self, _netns_created: bool, _netns_path: &str) -> Result<()> {
        Ok(())
    }

    async fn hot_attach(&mut self, _h: &dyn Hypervisor) -> Result<()> {
        Err(unsupported(EndpointType::VhostUser, "hot attach"))
    }

    async fn hot_detach(
        &mut self,
        _h: &dyn Hypervisor,
        _netns_created: bool,
        _netns_path: &str,
    ) -> Result<()> {
        Err(unsupported(EndpointType::VhostUser, "hot detach"))
    }

    fn save(&self) -> NetworkEndpoint {
        NetworkEndpoint {
            endpoint_type: EndpointType::VhostUser.to_string(),
            properties: (&self.properties).into(),
            pci_addr: self.pci_addr.clone(),
            vhost_user: Some(sandbox_persist::VhostUserEndpoint {
                iface_name: self.iface_name.clone(),
                hard_addr: self.hardware_addr.clone(),
                socket_path: self.socket_path.to_string_lossy().into_owned(),
            }),
            ..Default::default()
        }
    }
}
