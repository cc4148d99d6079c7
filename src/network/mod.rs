//! Network endpoints of a sandbox
//!
//! Each interface found in the sandbox network namespace becomes one
//! [`Endpoint`]. The variant decides how the interface reaches the guest:
//! - veth / macvlan / ipvlan: a tap paired with the interface
//! - tap: a bare tap created for the sandbox
//! - macvtap: queue fds opened on the macvtap link
//! - vhost-user: a vhost-user-net socket
//! - physical: the NIC itself, passed through with VFIO

pub mod host;
pub mod ipvlan;
pub mod macvlan;
pub mod macvtap;
pub mod pair;
pub mod physical;
pub mod tap;
pub mod veth;
pub mod vhost_user;

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, info, warn};

pub use host::{HostNetwork, OfflineHost};
pub use ipvlan::IPVlanEndpoint;
pub use macvlan::BridgedMacvlanEndpoint;
pub use macvtap::MacvtapEndpoint;
pub use pair::{
    generate_mac_address, NetInterworkingModel, NetworkInterface, NetworkInterfacePair,
    TapInterface,
};
pub use physical::PhysicalEndpoint;
pub use tap::TapEndpoint;
pub use veth::VethEndpoint;
pub use vhost_user::VhostUserEndpoint;

use crate::config::HotplugConfig;
use crate::hypervisor::Hypervisor;
use crate::{Error, Result};
use sandbox_persist::{NetworkEndpoint, NetworkInfo};

/// Endpoint kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointType {
    Physical,
    Veth,
    VhostUser,
    BridgedMacvlan,
    Macvtap,
    Tap,
    IPVlan,
}

const ALL_ENDPOINT_TYPES: [EndpointType; 7] = [
    EndpointType::Physical,
    EndpointType::Veth,
    EndpointType::VhostUser,
    EndpointType::BridgedMacvlan,
    EndpointType::Macvtap,
    EndpointType::Tap,
    EndpointType::IPVlan,
];

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Physical => "physical",
            EndpointType::Veth => "virtual",
            EndpointType::VhostUser => "vhost-user",
            EndpointType::BridgedMacvlan => "macvlan",
            EndpointType::Macvtap => "macvtap",
            EndpointType::Tap => "tap",
            EndpointType::IPVlan => "ipvlan",
        }
    }

    /// All seven kinds.
    pub fn all() -> &'static [EndpointType] {
        &ALL_ENDPOINT_TYPES
    }

    /// Replace `self` with the kind named by `value`. On error `self` is left
    /// untouched.
    pub fn set(&mut self, value: &str) -> Result<()> {
        *self = value.parse()?;
        Ok(())
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_ENDPOINT_TYPES
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::unknown_type("endpoint", s))
    }
}

/// Link attributes of the interface behind an endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkAttrs {
    pub name: String,
    pub hardware_addr: String,
    pub mtu: u32,
    /// Kernel link index
    pub index: u32,
    /// Link kind as reported by netlink (`veth`, `macvtap`, ...)
    pub link_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub dest: Option<IpNet>,
    pub gateway: Option<IpAddr>,
    pub device: String,
}

/// Interface, addresses and routes scanned from the sandbox namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkProperties {
    pub iface: LinkAttrs,
    pub addrs: Vec<IpNet>,
    pub routes: Vec<Route>,
}

impl NetworkProperties {
    pub fn new(name: impl Into<String>, link_type: impl Into<String>) -> Self {
        Self {
            iface: LinkAttrs {
                name: name.into(),
                link_type: link_type.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn hardware_addr(mut self, addr: impl Into<String>) -> Self {
        self.iface.hardware_addr = addr.into();
        self
    }

    pub fn link_index(mut self, index: u32) -> Self {
        self.iface.index = index;
        self
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.iface.mtu = mtu;
        self
    }

    pub fn addr(mut self, addr: IpNet) -> Self {
        self.addrs.push(addr);
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }
}

impl From<&NetworkProperties> for sandbox_persist::EndpointProperties {
    fn from(props: &NetworkProperties) -> Self {
        Self {
            iface: sandbox_persist::LinkAttrs {
                name: props.iface.name.clone(),
                hard_addr: props.iface.hardware_addr.clone(),
                mtu: props.iface.mtu,
                index: props.iface.index,
                link_type: props.iface.link_type.clone(),
            },
            addrs: props.addrs.clone(),
            routes: props
                .routes
                .iter()
                .map(|r| sandbox_persist::Route {
                    dest: r.dest,
                    gateway: r.gateway,
                    device: r.device.clone(),
                })
                .collect(),
        }
    }
}

impl From<&sandbox_persist::EndpointProperties> for NetworkProperties {
    fn from(saved: &sandbox_persist::EndpointProperties) -> Self {
        Self {
            iface: LinkAttrs {
                name: saved.iface.name.clone(),
                hardware_addr: saved.iface.hard_addr.clone(),
                mtu: saved.iface.mtu,
                index: saved.iface.index,
                link_type: saved.iface.link_type.clone(),
            },
            addrs: saved.addrs.clone(),
            routes: saved
                .routes
                .iter()
                .map(|r| Route {
                    dest: r.dest,
                    gateway: r.gateway,
                    device: r.device.clone(),
                })
                .collect(),
        }
    }
}

/// A network interface attached to the sandbox.
///
/// Mutating operations take `&mut self`; the owning [`SandboxNetwork`]
/// serializes them.
#[async_trait::async_trait]
pub trait Endpoint: fmt::Debug + Send + Sync {
    fn properties(&self) -> &NetworkProperties;

    /// Name of the guest-facing interface.
    fn name(&self) -> &str;

    fn hardware_addr(&self) -> &str;

    fn endpoint_type(&self) -> EndpointType;

    /// Guest PCI address, empty until a hotplug reports one.
    fn pci_addr(&self) -> &str;

    /// Tap pairing, for the pairable kinds.
    fn network_pair(&self) -> Option<&NetworkInterfacePair> {
        None
    }

    fn set_properties(&mut self, properties: NetworkProperties);

    fn set_pci_addr(&mut self, pci_addr: String);

    /// Add the endpoint to the VM configuration before boot.
    async fn attach(&mut self, h: &dyn Hypervisor) -> Result<()>;

    /// Tear down host-side resources after the VM is gone.
    async fn detach(&mut self, netns_created: bool, netns_path: &str) -> Result<()>;

    /// Plug the endpoint into a running VM.
    async fn hot_attach(&mut self, h: &dyn Hypervisor) -> Result<()>;

    /// Unplug the endpoint from a running VM.
    async fn hot_detach(
        &mut self,
        h: &dyn Hypervisor,
        netns_created: bool,
        netns_path: &str,
    ) -> Result<()>;

    /// Snapshot the endpoint.
    fn save(&self) -> NetworkEndpoint;
}

/// Disconnect a tap pair on detach.
///
/// A namespace we did not create is already gone along with everything in
/// it, so there is nothing left to undo.
pub(crate) async fn detach_pair(
    host: &dyn HostNetwork,
    pair: &NetworkInterfacePair,
    endpoint_type: EndpointType,
    netns_created: bool,
    netns_path: &str,
) -> Result<()> {
    if !netns_created {
        return Ok(());
    }
    info!(endpoint = %pair.virt_iface.name, %endpoint_type, "Detaching endpoint");
    host.disconnect_vm_network(pair, Path::new(netns_path)).await
}

pub(crate) fn unsupported(endpoint_type: EndpointType, op: &str) -> Error {
    Error::Unsupported(format!("{} endpoint does not support {}", endpoint_type, op))
}

/// Build the endpoint for interface number `idx`.
///
/// A PCI-backed interface becomes a physical endpoint and an interface with a
/// vhost-user socket becomes a vhost-user endpoint; everything else is chosen
/// by link type.
pub fn create_endpoint(
    idx: i32,
    properties: NetworkProperties,
    config: &HotplugConfig,
    host: Arc<dyn HostNetwork>,
) -> Result<Box<dyn Endpoint>> {
    let name = properties.iface.name.clone();
    let mut endpoint: Box<dyn Endpoint> = if PhysicalEndpoint::is_physical(&config.sysfs_root, &name)
    {
        Box::new(PhysicalEndpoint::from_sysfs(
            &config.sysfs_root,
            &name,
            &properties.iface.hardware_addr,
            host,
        )?)
    } else if let Some(socket) = vhost_user::find_socket(&config.vhost_user_dir, &properties.addrs)
    {
        Box::new(VhostUserEndpoint::new(
            &name,
            &properties.iface.hardware_addr,
            socket,
        ))
    } else {
        match properties.iface.link_type.as_str() {
            "veth" => Box::new(VethEndpoint::new(idx, &name, config.interworking_model, host)?),
            "macvlan" => Box::new(BridgedMacvlanEndpoint::new(
                idx,
                &name,
                config.interworking_model,
                host,
            )?),
            "macvtap" => Box::new(MacvtapEndpoint::new(host)),
            "tap" => Box::new(TapEndpoint::new(idx, &name, host)),
            "ipvlan" => Box::new(IPVlanEndpoint::new(idx, &name, host)?),
            other => {
                return Err(Error::unknown_type("network interface", other));
            }
        }
    };

    debug!(
        endpoint = %name,
        endpoint_type = %endpoint.endpoint_type(),
        "endpoint created"
    );
    endpoint.set_properties(properties);
    Ok(endpoint)
}

/// Ordered endpoints of one sandbox plus its namespace bookkeeping
#[derive(Debug, Default)]
pub struct SandboxNetwork {
    netns_path: String,
    netmon_pid: i32,
    netns_created: bool,
    endpoints: Vec<Box<dyn Endpoint>>,
}

impl SandboxNetwork {
    pub fn new(netns_path: impl Into<String>, netns_created: bool) -> Self {
        Self {
            netns_path: netns_path.into(),
            netns_created,
            ..Default::default()
        }
    }

    /// Rebuild from a snapshot. Nothing is attached or plugged.
    pub fn load(info: &NetworkInfo, host: Arc<dyn HostNetwork>) -> Result<Self> {
        let endpoints = info
            .endpoints
            .iter()
            .map(|saved| crate::persistence::load_endpoint(saved, Arc::clone(&host)))
            .collect::<Result<Vec<_>>>()?;
        debug!(count = endpoints.len(), netns = %info.netns_path, "endpoints restored");
        Ok(Self {
            netns_path: info.netns_path.clone(),
            netmon_pid: info.netmon_pid,
            netns_created: info.netns_created,
            endpoints,
        })
    }

    pub fn netns_path(&self) -> &str {
        &self.netns_path
    }

    pub fn netns_created(&self) -> bool {
        self.netns_created
    }

    pub fn netmon_pid(&self) -> i32 {
        self.netmon_pid
    }

    pub fn set_netmon_pid(&mut self, pid: i32) {
        self.netmon_pid = pid;
    }

    /// Endpoints in attach order.
    pub fn endpoints(&self) -> &[Box<dyn Endpoint>] {
        &self.endpoints
    }

    pub fn find_endpoint(&self, name: &str) -> Option<&dyn Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.as_ref())
    }

    /// Attach `endpoint` (hot-attach when the VM is running) and append it.
    /// A failed attach leaves the registry unchanged.
    pub async fn add_endpoint(
        &mut self,
        mut endpoint: Box<dyn Endpoint>,
        h: &dyn Hypervisor,
        hotplug: bool,
    ) -> Result<()> {
        if self.find_endpoint(endpoint.name()).is_some() {
            return Err(Error::Config(format!(
                "endpoint {} already attached",
                endpoint.name()
            )));
        }

        let result = if hotplug {
            endpoint.hot_attach(h).await
        } else {
            endpoint.attach(h).await
        };
        if let Err(e) = result {
            warn!(
                endpoint = endpoint.name(),
                endpoint_type = %endpoint.endpoint_type(),
                hotplug,
                "attach failed: {}",
                e
            );
            return Err(e);
        }

        info!(
            endpoint = endpoint.name(),
            endpoint_type = %endpoint.endpoint_type(),
            pci_addr = endpoint.pci_addr(),
            "endpoint attached"
        );
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Detach the endpoint called `name` and drop it from the registry.
    /// On failure the endpoint stays registered.
    pub async fn remove_endpoint(
        &mut self,
        name: &str,
        h: &dyn Hypervisor,
        hotplug: bool,
    ) -> Result<Box<dyn Endpoint>> {
        let pos = self
            .endpoints
            .iter()
            .position(|e| e.name() == name)
            .ok_or_else(|| Error::InvalidState(format!("endpoint {} not found", name)))?;

        let endpoint = &mut self.endpoints[pos];
        let result = if hotplug {
            endpoint
                .hot_detach(h, self.netns_created, &self.netns_path)
                .await
        } else {
            endpoint.detach(self.netns_created, &self.netns_path).await
        };
        if let Err(e) = result {
            warn!(endpoint = name, hotplug, "detach failed: {}", e);
            return Err(e);
        }

        info!(endpoint = name, "endpoint detached");
        Ok(self.endpoints.remove(pos))
    }

    /// Snapshot the namespace and every endpoint in order.
    pub fn save(&self) -> NetworkInfo {
        NetworkInfo {
            netns_path: self.netns_path.clone(),
            netmon_pid: self.netmon_pid,
            netns_created: self.netns_created,
            endpoints: self.endpoints.iter().map(|e| e.save()).collect(),
        }
    }
}
