use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use sandbox_hotplug::network::OfflineHost;
use sandbox_hotplug::persistence::{read_state_file, restore_sandbox, DiskStateStore};
use sandbox_hotplug::HotplugConfig;

/// Inspect saved sandbox device and network state
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the devices and endpoints recorded in a state file
    Show {
        /// State file, or a sandbox id looked up in the state directory
        target: String,
    },
    /// Decode every record and report the first inconsistency
    Validate {
        /// State file, or a sandbox id looked up in the state directory
        target: String,
    },
    /// List sandboxes in the state directory
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = HotplugConfig::from_env()?;

    match cli.command {
        Command::Show { target } => cmd_show(&config, &target)?,
        Command::Validate { target } => {
            if let Err(e) = cmd_validate(&config, &target) {
                error!("{}", e);
                std::process::exit(1);
            }
        }
        Command::List => {
            for id in DiskStateStore::from_config(&config).list_sandboxes()? {
                println!("{}", id);
            }
        }
    }

    Ok(())
}

fn resolve(config: &HotplugConfig, target: &str) -> PathBuf {
    let path = PathBuf::from(target);
    if path.exists() {
        path
    } else {
        DiskStateStore::from_config(config).state_path(target)
    }
}

fn cmd_show(config: &HotplugConfig, target: &str) -> Result<(), Box<dyn std::error::Error>> {
    let state = read_state_file(&resolve(config, target))?;

    println!("sandbox: {}", state.sandbox_id);
    println!("persist_version: {}", state.persist_version);
    println!("devices: {}", state.devices.len());
    for dev in &state.devices {
        println!(
            "  {:<32} {:<20} {}",
            dev.id, dev.device_type, dev.dev_info.host_path
        );
    }

    let net = &state.network;
    println!(
        "network: netns={} created={} netmon_pid={}",
        net.netns_path, net.netns_created, net.netmon_pid
    );
    for ep in &net.endpoints {
        let pci = if ep.pci_addr.is_empty() { "-" } else { ep.pci_addr.as_str() };
        println!(
            "  {:<16} {:<12} {:<18} pci={}",
            ep.properties.iface.name, ep.endpoint_type, ep.properties.iface.hard_addr, pci
        );
    }
    Ok(())
}

fn cmd_validate(config: &HotplugConfig, target: &str) -> sandbox_hotplug::Result<()> {
    let path = resolve(config, target);
    let state = read_state_file(&path)?;
    let (devices, network) = restore_sandbox(&state, config.clone(), Arc::new(OfflineHost))?;
    info!(
        path = %path.display(),
        devices = devices.devices().len(),
        endpoints = network.endpoints().len(),
        "state file is consistent"
    );
    Ok(())
}
