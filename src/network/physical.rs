//! Physical NICs passed through to the guest with VFIO.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::devices::VfioDev;
use crate::hypervisor::{Hypervisor, HypervisorDevice};
use crate::network::{unsupported, Endpoint, EndpointType, HostNetwork, NetworkProperties};
use crate::{Error, Result};
use sandbox_persist::NetworkEndpoint;

#[derive(Debug)]
pub struct PhysicalEndpoint {
    iface_name: String,
    hardware_addr: String,
    bdf: String,
    driver: String,
    vendor_device_id: String,
    properties: NetworkProperties,
    pci_addr: String,
    host: Arc<dyn HostNetwork>,
}

impl PhysicalEndpoint {
    pub fn new(
        iface_name: impl Into<String>,
        hardware_addr: impl Into<String>,
        bdf: impl Into<String>,
        driver: impl Into<String>,
        vendor_device_id: impl Into<String>,
        host: Arc<dyn HostNetwork>,
    ) -> Self {
        Self {
            iface_name: iface_name.into(),
            hardware_addr: hardware_addr.into(),
            bdf: bdf.into(),
            driver: driver.into(),
            vendor_device_id: vendor_device_id.into(),
            properties: NetworkProperties::default(),
            pci_addr: String::new(),
            host,
        }
    }

    /// Whether `iface` sits on a bus (has a sysfs `device` link).
    pub fn is_physical(sysfs_root: &Path, iface: &str) -> bool {
        !iface.is_empty()
            && sysfs_root
                .join("class/net")
                .join(iface)
                .join("device")
                .exists()
    }

    /// Resolve BDF, driver and vendor/device id of `iface` from sysfs.
    pub fn from_sysfs(
        sysfs_root: &Path,
        iface: &str,
        hardware_addr: &str,
        host: Arc<dyn HostNetwork>,
    ) -> Result<Self> {
        let device = sysfs_root.join("class/net").join(iface).join("device");
        let bdf = link_name(&device)?;
        let driver = link_name(&device.join("driver"))?;

        let pci_dev = sysfs_root.join("bus/pci/devices").join(&bdf);
        let vendor = read_id(&pci_dev.join("vendor"))?;
        let device_id = read_id(&pci_dev.join("device"))?;

        Ok(Self::new(
            iface,
            hardware_addr,
            bdf,
            driver,
            format!("{} {}", vendor, device_id),
            host,
        ))
    }

    pub fn bdf(&self) -> &str {
        &self.bdf
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn vendor_device_id(&self) -> &str {
        &self.vendor_device_id
    }

    pub(crate) fn from_snapshot(
        saved: &NetworkEndpoint,
        payload: &sandbox_persist::PhysicalEndpoint,
        host: Arc<dyn HostNetwork>,
    ) -> Self {
        let mut endpoint = Self::new(
            payload.iface_name.clone(),
            payload.hard_addr.clone(),
            payload.bdf.clone(),
            payload.driver.clone(),
            payload.vendor_device_id.clone(),
            host,
        );
        endpoint.properties = (&saved.properties).into();
        endpoint.pci_addr = saved.pci_addr.clone();
        endpoint
    }
}

/// Final component of the symlink target at `path`.
fn link_name(path: &Path) -> Result<String> {
    let target = fs::read_link(path)?;
    target
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Network(format!("unexpected link target for {}", path.display())))
}

/// sysfs id file without its `0x` prefix.
fn read_id(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)?;
    let id = raw.trim();
    Ok(id.strip_prefix("0x").unwrap_or(id).to_string())
}

#[async_trait::async_trait]
impl Endpoint for PhysicalEndpoint {
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
        EndpointType::Physical
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
        info!(endpoint = %self.iface_name, bdf = %self.bdf, "binding NIC to vfio-pci");
        self.host
            .bind_to_vfio(&self.bdf, &self.vendor_device_id)
            .await?;

        let dev = VfioDev {
            id: String::new(),
            bdf: self.bdf.clone(),
            sysfs_dev: Default::default(),
        };
        h.add_device(HypervisorDevice::Vfio(vec![dev])).await
    }

    async fn detach(&mut self, _netns_created: bool, _netns_path: &str) -> Result<()> {
        // The NIC goes back to its host driver whether or not we own the namespace.
        info!(endpoint = %self.iface_name, bdf = %self.bdf, driver = %self.driver, "binding NIC back to host driver");
        self.host
            .bind_to_host_driver(&self.bdf, &self.driver, &self.vendor_device_id)
            .await
    }

    async fn hot_attach(&mut self, _h: &dyn Hypervisor) -> Result<()> {
        Err(unsupported(EndpointType::Physical, "hot attach"))
    }

    async fn hot_detach(
        &mut self,
        _h: &dyn Hypervisor,
        _netns_created: bool,
        _netns_path: &str,
    ) -> Result<()> {
        Err(unsupported(EndpointType::Physical, "hot detach"))
    }

    fn save(&self) -> NetworkEndpoint {
        NetworkEndpoint {
            endpoint_type: EndpointType::Physical.to_string(),
            properties: (&self.properties).into(),
            pci_addr: self.pci_addr.clone(),
            physical: Some(sandbox_persist::PhysicalEndpoint {
                iface_name: self.iface_name.clone(),
                hard_addr: self.hardware_addr.clone(),
                bdf: self.bdf.clone(),
                driver: self.driver.clone(),
                vendor_device_id: self.vendor_device_id.clone(),
            }),
            ..Default::default()
        }
    }
}
