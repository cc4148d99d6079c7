//! sandbox-hotplug: device and network endpoint hotplug for VM sandboxes
//!
//! The crate tracks the devices and network interfaces a sandbox hands to its
//! VM, decides when a real hotplug is needed, and snapshots all of it so a
//! restarted runtime can pick up where it left off.
//!
//! # Key Features
//!
//! - **Reference-counted attach**: containers sharing a device share one
//!   hotplug; only the first attach and the last detach reach the VMM
//! - **Compensation**: a failed attach gives back every block index and
//!   counter increment it took
//! - **Seven endpoint kinds**: veth, macvlan, ipvlan, macvtap, tap,
//!   vhost-user and physical NICs
//! - **Versioned snapshots**: Go-compatible JSON records that reject
//!   inconsistent payloads on load
//!
//! # Example: Attach a shared block device
//!
//! ```no_run
//! use std::sync::Arc;
//! use sandbox_hotplug::prelude::*;
//!
//! # async fn demo(hypervisor: Arc<dyn Hypervisor>) -> sandbox_hotplug::Result<()> {
//! let config = HotplugConfig::from_env()?;
//! let receiver = HypervisorReceiver::new(hypervisor, config.max_block_index);
//! let devices = DeviceManager::new(config);
//!
//! let disk = devices.new_device(DeviceInfo::new("data", "/dev/sdb").block(8, 16))?;
//! devices.attach_device(disk.id(), &receiver).await?; // hotplugs
//! devices.attach_device(disk.id(), &receiver).await?; // shared, no hotplug
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod hypervisor;
pub mod network;
pub mod persistence;
pub mod sandbox;
pub mod utils;

// Re-exports for convenience
pub use config::HotplugConfig;
pub use error::{Error, Result};
pub use sandbox_persist as persist;

// Prelude for common imports
pub mod prelude {
    pub use crate::config::{BlockDriver, HotplugConfig};
    pub use crate::devices::{Device, DeviceInfo, DeviceManager, DeviceType};
    pub use crate::error::{Error, Result};
    pub use crate::hypervisor::{Hypervisor, HypervisorConfig, HypervisorDevice};
    pub use crate::network::{
        create_endpoint, Endpoint, EndpointType, HostNetwork, NetInterworkingModel,
        NetworkProperties, SandboxNetwork,
    };
    pub use crate::persistence::{restore_sandbox, snapshot_sandbox, DiskStateStore};
    pub use crate::sandbox::{DeviceReceiver, HypervisorReceiver};
}
