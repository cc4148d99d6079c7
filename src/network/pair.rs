//! Tap / virtual interface pairing for VM-bridged networking.
//!
//! A pairable endpoint (veth, macvlan, ipvlan) couples the interface living in
//! the sandbox network namespace with a tap device the VMM opens. The
//! interworking model decides how traffic crosses between the two.

use std::fmt;
use std::str::FromStr;

use ipnet::IpNet;

use crate::{Error, Result};

/// Strategy joining the host-side interface and the VM tap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NetInterworkingModel {
    /// Resolved to [`NetInterworkingModel::TcFilter`] when a pair is built
    #[default]
    Default,
    /// Linux bridge between the veth and the tap
    Bridged,
    /// macvtap on top of the veth
    MacVtap,
    /// The VMM attaches to the veth directly
    Enlightened,
    /// tc mirred redirection between veth and tap
    TcFilter,
    /// Tap created without any host plumbing
    None,
}

const ALL_MODELS: [NetInterworkingModel; 6] = [
    NetInterworkingModel::Default,
    NetInterworkingModel::Bridged,
    NetInterworkingModel::MacVtap,
    NetInterworkingModel::Enlightened,
    NetInterworkingModel::TcFilter,
    NetInterworkingModel::None,
];

impl NetInterworkingModel {
    /// Model used when the configuration asks for the default.
    pub const DEFAULT_RESOLVED: NetInterworkingModel = NetInterworkingModel::TcFilter;

    pub fn as_str(&self) -> &'static str {
        match self {
            NetInterworkingModel::Default => "default",
            NetInterworkingModel::Bridged => "bridged",
            NetInterworkingModel::MacVtap => "macvtap",
            NetInterworkingModel::Enlightened => "enlightened",
            NetInterworkingModel::TcFilter => "tcfilter",
            NetInterworkingModel::None => "none",
        }
    }

    /// Replace `Default` with the concrete model.
    pub fn resolve(self) -> Self {
        match self {
            NetInterworkingModel::Default => Self::DEFAULT_RESOLVED,
            other => other,
        }
    }

    /// Every model, in persisted-integer order.
    pub fn all() -> &'static [NetInterworkingModel] {
        &ALL_MODELS
    }
}

impl From<NetInterworkingModel> for i32 {
    fn from(model: NetInterworkingModel) -> i32 {
        match model {
            NetInterworkingModel::Default => 0,
            NetInterworkingModel::Bridged => 1,
            NetInterworkingModel::MacVtap => 2,
            NetInterworkingModel::Enlightened => 3,
            NetInterworkingModel::TcFilter => 4,
            NetInterworkingModel::None => 5,
        }
    }
}

impl TryFrom<i32> for NetInterworkingModel {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        ALL_MODELS
            .iter()
            .copied()
            .find(|m| i32::from(*m) == value)
            .ok_or_else(|| Error::unknown_type("interworking model", value.to_string()))
    }
}

impl fmt::Display for NetInterworkingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetInterworkingModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_MODELS
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::unknown_type("interworking model", s))
    }
}

/// A network interface as seen from one side of a pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub hardware_addr: String,
    pub addrs: Vec<IpNet>,
}

/// Host-side tap interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TapInterface {
    pub id: String,
    /// Bridge (or endpoint) name the tap hangs off
    pub name: String,
    pub tap_iface: NetworkInterface,
}

/// Host tap bound to the guest-visible virtual interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterfacePair {
    pub tap: TapInterface,
    pub virt_iface: NetworkInterface,
    pub model: NetInterworkingModel,
}

impl NetworkInterfacePair {
    /// Build the pair for interface number `idx`.
    ///
    /// Names follow `br{idx}_kata` / `tap{idx}_kata` / `eth{idx}`; a non-empty
    /// `if_name` overrides the virtual interface name.
    pub fn new(idx: i32, if_name: &str, model: NetInterworkingModel) -> Result<Self> {
        if idx < 0 {
            return Err(Error::Config(format!("invalid network endpoint index: {}", idx)));
        }

        let virt_name = if if_name.is_empty() {
            format!("eth{}", idx)
        } else {
            if_name.to_string()
        };

        Ok(Self {
            tap: TapInterface {
                id: uuid::Uuid::now_v7().to_string(),
                name: format!("br{}_kata", idx),
                tap_iface: NetworkInterface {
                    name: format!("tap{}_kata", idx),
                    ..Default::default()
                },
            },
            virt_iface: NetworkInterface {
                name: virt_name,
                hardware_addr: generate_mac_address()?,
                addrs: Vec::new(),
            },
            model: model.resolve(),
        })
    }
}

impl From<&NetworkInterface> for sandbox_persist::NetworkInterface {
    fn from(iface: &NetworkInterface) -> Self {
        Self {
            name: iface.name.clone(),
            hard_addr: iface.hardware_addr.clone(),
            addrs: iface.addrs.clone(),
        }
    }
}

impl From<&sandbox_persist::NetworkInterface> for NetworkInterface {
    fn from(saved: &sandbox_persist::NetworkInterface) -> Self {
        Self {
            name: saved.name.clone(),
            hardware_addr: saved.hard_addr.clone(),
            addrs: saved.addrs.clone(),
        }
    }
}

impl From<&TapInterface> for sandbox_persist::TapInterface {
    fn from(tap: &TapInterface) -> Self {
        Self {
            id: tap.id.clone(),
            name: tap.name.clone(),
            tap_iface: (&tap.tap_iface).into(),
        }
    }
}

impl From<&sandbox_persist::TapInterface> for TapInterface {
    fn from(saved: &sandbox_persist::TapInterface) -> Self {
        Self {
            id: saved.id.clone(),
            name: saved.name.clone(),
            tap_iface: (&saved.tap_iface).into(),
        }
    }
}

impl From<&NetworkInterfacePair> for sandbox_persist::NetworkInterfacePair {
    fn from(pair: &NetworkInterfacePair) -> Self {
        Self {
            tap_interface: (&pair.tap).into(),
            virt_iface: (&pair.virt_iface).into(),
            net_interworking_model: pair.model.into(),
        }
    }
}

impl TryFrom<&sandbox_persist::NetworkInterfacePair> for NetworkInterfacePair {
    type Error = Error;

    fn try_from(saved: &sandbox_persist::NetworkInterfacePair) -> Result<Self> {
        Ok(Self {
            tap: (&saved.tap_interface).into(),
            virt_iface: (&saved.virt_iface).into(),
            model: NetInterworkingModel::try_from(saved.net_interworking_model)?,
        })
    }
}

/// Generate a random MAC address with the locally administered bit set
pub fn generate_mac_address() -> Result<String> {
    let mut buf = [0u8; 6];
    getrandom::fill(&mut buf)
        .map_err(|e| Error::Network(format!("failed to generate MAC address: {}", e)))?;

    // Set locally administered bit (bit 1 of first byte)
    // Clear multicast bit (bit 0 of first byte)
    buf[0] = (buf[0] & 0xFC) | 0x02;

    Ok(format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_integer_mapping_is_invertible() {
        for model in NetInterworkingModel::all() {
            let n = i32::from(*model);
            assert_eq!(NetInterworkingModel::try_from(n).unwrap(), *model);
            assert_eq!(model.as_str().parse::<NetInterworkingModel>().unwrap(), *model);
        }
        assert!(matches!(
            NetInterworkingModel::try_from(42),
            Err(Error::UnknownType { .. })
        ));
        assert!(matches!(
            "bridge".parse::<NetInterworkingModel>(),
            Err(Error::UnknownType { .. })
        ));
    }

    #[test]
    fn test_pair_naming() {
        let pair = NetworkInterfacePair::new(2, "", NetInterworkingModel::Default).unwrap();
        assert_eq!(pair.tap.name, "br2_kata");
        assert_eq!(pair.tap.tap_iface.name, "tap2_kata");
        assert_eq!(pair.virt_iface.name, "eth2");
        assert_eq!(pair.model, NetInterworkingModel::TcFilter);
        assert!(!pair.tap.id.is_empty());

        let named = NetworkInterfacePair::new(0, "net1", NetInterworkingModel::MacVtap).unwrap();
        assert_eq!(named.virt_iface.name, "net1");
        assert_eq!(named.model, NetInterworkingModel::MacVtap);
    }

    #[test]
    fn test_pair_persist_conversion() {
        let mut pair = NetworkInterfacePair::new(1, "", NetInterworkingModel::Bridged).unwrap();
        pair.virt_iface.addrs.push("10.0.0.2/24".parse().unwrap());
        pair.tap.tap_iface.hardware_addr = "02:00:00:00:00:01".into();

        let saved = sandbox_persist::NetworkInterfacePair::from(&pair);
        assert_eq!(saved.net_interworking_model, 1);
        assert_eq!(saved.tap_interface.tap_iface.name, "tap1_kata");
        assert_eq!(NetworkInterfacePair::try_from(&saved).unwrap(), pair);

        let bad = sandbox_persist::NetworkInterfacePair {
            net_interworking_model: 9,
            ..saved
        };
        assert!(matches!(
            NetworkInterfacePair::try_from(&bad),
            Err(Error::UnknownType { .. })
        ));
    }

    #[test]
    fn test_negative_index_rejected() {
        assert!(NetworkInterfacePair::new(-1, "", NetInterworkingModel::Bridged).is_err());
    }

    #[test]
    fn test_generate_mac_address() {
        let mac = generate_mac_address().unwrap();
        assert_eq!(mac.len(), 17); // XX:XX:XX:XX:XX:XX

        // Parse first byte and verify locally administered bit
        let first_byte = u8::from_str_radix(&mac[0..2], 16).unwrap();
        assert!(first_byte & 0x02 != 0); // Locally administered
        assert!(first_byte & 0x01 == 0); // Not multicast
    }
}
