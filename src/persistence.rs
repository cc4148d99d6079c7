//! Snapshot codec and on-disk sandbox state.
//!
//! `load_device` / `load_endpoint` turn persisted records back into live
//! objects. They check that the record carries exactly the payload its `Type`
//! names and never talk to the hypervisor; restored objects start detached.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::HotplugConfig;
use crate::devices::{
    BlockDevice, Device, DeviceManager, DeviceType, GenericDevice, VfioDevice, VhostUserBlkDevice,
};
use crate::network::{
    BridgedMacvlanEndpoint, Endpoint, EndpointType, HostNetwork, IPVlanEndpoint, MacvtapEndpoint,
    NetworkInterfacePair, PhysicalEndpoint, SandboxNetwork, TapEndpoint, VethEndpoint,
    VhostUserEndpoint,
};
use crate::{Error, Result};
use sandbox_persist::{DeviceState, NetworkEndpoint, SandboxState, PERSIST_VERSION};

/// Fail unless `populated` is exactly `[expected]`.
fn expect_single_payload(
    record: &str,
    discriminator: &str,
    populated: &[&'static str],
    expected: &'static str,
) -> Result<()> {
    if populated == [expected] {
        return Ok(());
    }
    Err(Error::InconsistentSnapshot(format!(
        "{} of type {:?} carries payloads {:?}, expected only {}",
        record, discriminator, populated, expected
    )))
}

/// Rebuild a device from its record.
pub fn load_device(state: &DeviceState, config: &HotplugConfig) -> Result<Arc<dyn Device>> {
    let device_type: DeviceType = state.device_type.parse()?;
    let populated = state.populated_variants();
    let record = format!("device {}", state.id);

    let device: Arc<dyn Device> = match device_type {
        DeviceType::Generic => {
            expect_single_payload(&record, &state.device_type, &populated, "GenericDev")?;
            let attrs = state.generic_dev.as_ref().ok_or_else(missing)?;
            Arc::new(GenericDevice::from_snapshot(state, attrs))
        }
        DeviceType::Block => {
            expect_single_payload(&record, &state.device_type, &populated, "BlockDrive")?;
            let drive = state.block_drive.as_ref().ok_or_else(missing)?;
            Arc::new(BlockDevice::from_snapshot(state, drive))
        }
        DeviceType::Vfio => {
            expect_single_payload(&record, &state.device_type, &populated, "VFIODevs")?;
            let devs = state.vfio_devs.as_deref().ok_or_else(missing)?;
            Arc::new(VfioDevice::from_snapshot(state, devs, config.sysfs_root.clone()))
        }
        DeviceType::VhostUserBlk => {
            expect_single_payload(&record, &state.device_type, &populated, "VhostUserDev")?;
            let attrs = state.vhost_user_dev.as_ref().ok_or_else(missing)?;
            Arc::new(VhostUserBlkDevice::from_snapshot(state, attrs)?)
        }
        DeviceType::VhostUserNet => {
            return Err(Error::InconsistentSnapshot(format!(
                "{} has type {}, which is only used by network endpoints",
                record, device_type
            )));
        }
    };

    debug!(device = %state.id, %device_type, "device loaded");
    Ok(device)
}

/// Rebuild an endpoint from its record.
pub fn load_endpoint(saved: &NetworkEndpoint, host: Arc<dyn HostNetwork>) -> Result<Box<dyn Endpoint>> {
    let endpoint_type: EndpointType = saved.endpoint_type.parse()?;
    let populated = saved.populated_variants();
    let record = format!("endpoint {}", saved.properties.iface.name);
    let check = |expected| expect_single_payload(&record, &saved.endpoint_type, &populated, expected);

    let endpoint: Box<dyn Endpoint> = match endpoint_type {
        EndpointType::Physical => {
            check("Physical")?;
            let payload = saved.physical.as_ref().ok_or_else(missing)?;
            Box::new(PhysicalEndpoint::from_snapshot(saved, payload, host))
        }
        EndpointType::Veth => {
            check("Veth")?;
            let payload = saved.veth.as_ref().ok_or_else(missing)?;
            let pair = NetworkInterfacePair::try_from(&payload.net_pair)?;
            Box::new(VethEndpoint::from_snapshot(saved, pair, host))
        }
        EndpointType::VhostUser => {
            check("VhostUser")?;
            let payload = saved.vhost_user.as_ref().ok_or_else(missing)?;
            Box::new(VhostUserEndpoint::from_snapshot(saved, payload))
        }
        EndpointType::BridgedMacvlan => {
            check("BridgedMacvlan")?;
            let payload = saved.bridged_macvlan.as_ref().ok_or_else(missing)?;
            let pair = NetworkInterfacePair::try_from(&payload.net_pair)?;
            Box::new(BridgedMacvlanEndpoint::from_snapshot(saved, pair, host))
        }
        EndpointType::Macvtap => {
            check("Macvtap")?;
            Box::new(MacvtapEndpoint::from_snapshot(saved, host))
        }
        EndpointType::Tap => {
            check("Tap")?;
            let payload = saved.tap.as_ref().ok_or_else(missing)?;
            Box::new(TapEndpoint::from_snapshot(
                saved,
                (&payload.tap_interface).into(),
                host,
            ))
        }
        EndpointType::IPVlan => {
            check("IPVlan")?;
            let payload = saved.ipvlan.as_ref().ok_or_else(missing)?;
            let pair = NetworkInterfacePair::try_from(&payload.net_pair)?;
            Box::new(IPVlanEndpoint::from_snapshot(saved, pair, host))
        }
    };

    debug!(endpoint = endpoint.name(), %endpoint_type, "endpoint loaded");
    Ok(endpoint)
}

// Unreachable once the payload check passed.
fn missing() -> Error {
    Error::InconsistentSnapshot("payload vanished after validation".into())
}

/// Snapshot every device and endpoint of a sandbox.
pub fn snapshot_sandbox(
    sandbox_id: &str,
    devices: &DeviceManager,
    network: &SandboxNetwork,
) -> SandboxState {
    SandboxState {
        devices: devices.save(),
        network: network.save(),
        ..SandboxState::new(sandbox_id)
    }
}

/// Check the layout version and decode every record.
pub fn restore_sandbox(
    state: &SandboxState,
    config: HotplugConfig,
    host: Arc<dyn HostNetwork>,
) -> Result<(DeviceManager, SandboxNetwork)> {
    check_version(state)?;
    let devices = DeviceManager::load(config, &state.devices)?;
    let network = SandboxNetwork::load(&state.network, host)?;
    info!(
        sandbox = %state.sandbox_id,
        devices = state.devices.len(),
        endpoints = state.network.endpoints.len(),
        "sandbox state restored"
    );
    Ok((devices, network))
}

fn check_version(state: &SandboxState) -> Result<()> {
    if state.persist_version != PERSIST_VERSION {
        return Err(Error::InconsistentSnapshot(format!(
            "sandbox {} has persist version {}, expected {}",
            state.sandbox_id, state.persist_version, PERSIST_VERSION
        )));
    }
    Ok(())
}

/// Read and version-check a state file.
pub fn read_state_file(path: &Path) -> Result<SandboxState> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed reading {}: {e}", path.display())))?;
    let state: SandboxState = serde_json::from_str(&data)?;
    check_version(&state)?;
    Ok(state)
}

/// Sandbox states stored as `<state_dir>/sandboxes/<id>.json`.
pub struct DiskStateStore {
    state_dir: PathBuf,
    lock: Mutex<()>,
}

impl DiskStateStore {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &HotplugConfig) -> Self {
        Self::new(config.state_dir.clone())
    }

    fn sandboxes_dir(&self) -> PathBuf {
        self.state_dir.join("sandboxes")
    }

    pub fn state_path(&self, sandbox_id: &str) -> PathBuf {
        self.sandboxes_dir().join(format!("{}.json", sandbox_id))
    }

    fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.sandboxes_dir())
            .map_err(|e| Error::Config(format!("failed to create sandboxes dir: {e}")))
    }

    pub fn save_sandbox(&self, state: &SandboxState) -> Result<()> {
        if state.sandbox_id.is_empty() {
            return Err(Error::Config("sandbox id is empty".into()));
        }
        let _g = self
            .lock
            .lock()
            .map_err(|_| Error::Config("state store lock poisoned".into()))?;
        self.ensure_dirs()?;

        let path = self.state_path(&state.sandbox_id);
        let data = serde_json::to_vec_pretty(state)?;
        fs::write(&path, data)
            .map_err(|e| Error::Config(format!("failed writing {}: {e}", path.display())))?;
        debug!(sandbox = %state.sandbox_id, path = %path.display(), "sandbox state saved");
        Ok(())
    }

    pub fn load_sandbox(&self, sandbox_id: &str) -> Result<SandboxState> {
        let _g = self
            .lock
            .lock()
            .map_err(|_| Error::Config("state store lock poisoned".into()))?;
        read_state_file(&self.state_path(sandbox_id))
    }

    /// Ids of every stored sandbox, sorted.
    pub fn list_sandboxes(&self) -> Result<Vec<String>> {
        let _g = self
            .lock
            .lock()
            .map_err(|_| Error::Config("state store lock poisoned".into()))?;
        self.ensure_dirs()?;

        let mut ids = Vec::new();
        for entry in fs::read_dir(self.sandboxes_dir())
            .map_err(|e| Error::Config(format!("failed to read sandboxes dir: {e}")))?
        {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a stored sandbox. Missing state is not an error.
    pub fn remove_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let _g = self
            .lock
            .lock()
            .map_err(|_| Error::Config("state store lock poisoned".into()))?;
        match fs::remove_file(self.state_path(sandbox_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
