//! Persisted snapshot schema for sandbox devices and network endpoints.
//!
//! This crate is the single source of truth for the on-disk layout written at
//! checkpoint time and read back on recovery. It carries plain data only: the
//! codec in `sandbox-hotplug` converts live devices and endpoints to and from
//! these records and enforces their consistency rules.
//!
//! ## Tagged records
//!
//! Device and endpoint records are flat, tagged-union shaped:
//!
//! ```text
//! { "Type": "virtual", "Properties": {...}, "PCIAddr": "", "Veth": { "NetPair": {...} } }
//! ```
//!
//! - **Type**: discriminator string naming the live variant.
//! - **payload**: exactly one of the optional variant fields is present and it
//!   must be the one matching `Type`. Absent payloads are omitted from the JSON.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Version of the snapshot layout. Bumped on incompatible schema changes.
pub const PERSIST_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Network interfaces
// ---------------------------------------------------------------------------

/// A host or guest network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInterface {
    pub name: String,
    pub hard_addr: String,
    #[serde(default)]
    pub addrs: Vec<IpNet>,
}

/// A tap interface on the host side of a pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapInterface {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "TAPIface")]
    pub tap_iface: NetworkInterface,
}

/// A pair between the VM-facing tap and the virtual network interface.
///
/// The tap fields are flattened into the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInterfacePair {
    #[serde(flatten)]
    pub tap_interface: TapInterface,
    pub virt_iface: NetworkInterface,
    pub net_interworking_model: i32,
}

// ---------------------------------------------------------------------------
// Endpoint properties
// ---------------------------------------------------------------------------

/// Link attributes of the interface backing an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAttrs {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "HardAddr")]
    pub hard_addr: String,
    #[serde(rename = "MTU")]
    pub mtu: u32,
    #[serde(rename = "Index")]
    pub index: u32,
    #[serde(rename = "LinkType")]
    pub link_type: String,
}

/// A route installed for an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<IpNet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub device: String,
}

/// Network properties shared by every endpoint kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointProperties {
    pub iface: LinkAttrs,
    #[serde(default)]
    pub addrs: Vec<IpNet>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

// ---------------------------------------------------------------------------
// Endpoint payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalEndpoint {
    #[serde(rename = "IfaceName")]
    pub iface_name: String,
    #[serde(rename = "HardAddr")]
    pub hard_addr: String,
    #[serde(rename = "BDF")]
    pub bdf: String,
    #[serde(rename = "Driver")]
    pub driver: String,
    #[serde(rename = "VendorDeviceID")]
    pub vendor_device_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VethEndpoint {
    pub net_pair: NetworkInterfacePair,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VhostUserEndpoint {
    pub iface_name: String,
    pub hard_addr: String,
    pub socket_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BridgedMacvlanEndpoint {
    pub net_pair: NetworkInterfacePair,
}

/// Macvtap endpoints keep everything they need in the shared properties;
/// their file descriptors are runtime handles and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacvtapEndpoint {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TapEndpoint {
    pub tap_interface: TapInterface,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IPVlanEndpoint {
    pub net_pair: NetworkInterfacePair,
}

/// One network endpoint record.
///
/// One and only one of the payload fields is present, according to `Type`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    #[serde(rename = "Type")]
    pub endpoint_type: String,
    #[serde(rename = "Properties", default)]
    pub properties: EndpointProperties,
    #[serde(rename = "PCIAddr", default)]
    pub pci_addr: String,

    #[serde(rename = "Physical", default, skip_serializing_if = "Option::is_none")]
    pub physical: Option<PhysicalEndpoint>,
    #[serde(rename = "Veth", default, skip_serializing_if = "Option::is_none")]
    pub veth: Option<VethEndpoint>,
    #[serde(rename = "VhostUser", default, skip_serializing_if = "Option::is_none")]
    pub vhost_user: Option<VhostUserEndpoint>,
    #[serde(rename = "BridgedMacvlan", default, skip_serializing_if = "Option::is_none")]
    pub bridged_macvlan: Option<BridgedMacvlanEndpoint>,
    #[serde(rename = "Macvtap", default, skip_serializing_if = "Option::is_none")]
    pub macvtap: Option<MacvtapEndpoint>,
    #[serde(rename = "Tap", default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<TapEndpoint>,
    #[serde(rename = "IPVlan", default, skip_serializing_if = "Option::is_none")]
    pub ipvlan: Option<IPVlanEndpoint>,
}

impl NetworkEndpoint {
    /// Names of the payload fields that are present, in declaration order.
    pub fn populated_variants(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.physical.is_some() {
            out.push("Physical");
        }
        if self.veth.is_some() {
            out.push("Veth");
        }
        if self.vhost_user.is_some() {
            out.push("VhostUser");
        }
        if self.bridged_macvlan.is_some() {
            out.push("BridgedMacvlan");
        }
        if self.macvtap.is_some() {
            out.push("Macvtap");
        }
        if self.tap.is_some() {
            out.push("Tap");
        }
        if self.ipvlan.is_some() {
            out.push("IPVlan");
        }
        out
    }
}

/// Network information of a sandbox.
///
/// `endpoints` keeps interface attach order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(rename = "NetNsPath")]
    pub netns_path: String,
    #[serde(rename = "NetmonPID")]
    pub netmon_pid: i32,
    #[serde(rename = "NetNsCreated")]
    pub netns_created: bool,
    #[serde(rename = "Endpoints", default)]
    pub endpoints: Vec<NetworkEndpoint>,
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Attributes common to every device record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfo {
    pub host_path: String,
    #[serde(default)]
    pub container_path: String,
    #[serde(default)]
    pub dev_type: String,
    #[serde(default)]
    pub major: i64,
    #[serde(default)]
    pub minor: i64,
    #[serde(default)]
    pub cold_plug: bool,
    #[serde(default)]
    pub driver_options: BTreeMap<String, String>,
}

/// Character/generic device permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericDeviceAttrs {
    #[serde(rename = "FileMode")]
    pub file_mode: u32,
    #[serde(rename = "UID")]
    pub uid: u32,
    #[serde(rename = "GID")]
    pub gid: u32,
}

/// A block drive as handed to the hypervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDrive {
    #[serde(rename = "File")]
    pub file: String,
    #[serde(rename = "Format")]
    pub format: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Index", default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(rename = "SCSIAddr", default)]
    pub scsi_addr: String,
    #[serde(rename = "VirtPath", default)]
    pub virt_path: String,
    #[serde(rename = "Pmem", default)]
    pub pmem: bool,
}

/// One member of a VFIO group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VFIODev {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "BDF")]
    pub bdf: String,
    #[serde(rename = "SysfsDev")]
    pub sysfs_dev: String,
}

/// Vhost-user device attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VhostUserDeviceAttrs {
    #[serde(rename = "DevID")]
    pub dev_id: String,
    pub socket_path: String,
    #[serde(rename = "Type")]
    pub device_type: String,
    #[serde(default)]
    pub mac_address: String,
}

/// One device record.
///
/// One and only one of the payload fields is present, according to `Type`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub device_type: String,
    #[serde(rename = "DevInfo")]
    pub dev_info: DeviceInfo,

    #[serde(rename = "GenericDev", default, skip_serializing_if = "Option::is_none")]
    pub generic_dev: Option<GenericDeviceAttrs>,
    #[serde(rename = "BlockDrive", default, skip_serializing_if = "Option::is_none")]
    pub block_drive: Option<BlockDrive>,
    #[serde(rename = "VFIODevs", default, skip_serializing_if = "Option::is_none")]
    pub vfio_devs: Option<Vec<VFIODev>>,
    #[serde(rename = "VhostUserDev", default, skip_serializing_if = "Option::is_none")]
    pub vhost_user_dev: Option<VhostUserDeviceAttrs>,
}

impl DeviceState {
    /// Names of the payload fields that are present, in declaration order.
    pub fn populated_variants(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.generic_dev.is_some() {
            out.push("GenericDev");
        }
        if self.block_drive.is_some() {
            out.push("BlockDrive");
        }
        if self.vfio_devs.is_some() {
            out.push("VFIODevs");
        }
        if self.vhost_user_dev.is_some() {
            out.push("VhostUserDev");
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Sandbox envelope
// ---------------------------------------------------------------------------

/// Everything persisted for one sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxState {
    #[serde(rename = "PersistVersion")]
    pub persist_version: u32,
    #[serde(rename = "SandboxID")]
    pub sandbox_id: String,
    #[serde(rename = "Devices", default)]
    pub devices: Vec<DeviceState>,
    #[serde(rename = "Network", default)]
    pub network: NetworkInfo,
}

impl SandboxState {
    /// Create an empty state for `sandbox_id` at the current layout version.
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            persist_version: PERSIST_VERSION,
            sandbox_id: sandbox_id.into(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
