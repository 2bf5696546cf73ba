use anyhow::{Context, Result as Anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use padremapd::{
    Device, DeviceInfo, EngineBus, EngineEvent, EventFilter, HardwareManager, Profile,
};

/// Daemon configuration: the devices to manage and the profile to apply to
/// each once its hardware shows up.
#[derive(Debug, Deserialize)]
struct DaemonConfig {
    devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
struct DeviceConfig {
    #[serde(flatten)]
    info: DeviceInfo,
    profile: Profile,
}

fn main() -> Anyhow<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .context("Usage: padremapd <config.json>")?;
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read the config file {path}"))?;
    let config: DaemonConfig =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {path}"))?;

    let manager = Arc::new(HardwareManager::new());
    let mut profiles: HashMap<String, Profile> = HashMap::new();
    for device in &config.devices {
        profiles.insert(device.info.signature.clone(), device.profile.clone());
    }
    subscribe_ui_boundary(&manager.bus(), manager.clone(), profiles);

    for device in config.devices {
        info!(device = device.info.signature.as_str(), "managing device");
        manager.add_managed_device(Arc::new(Device::new(device.info)));
    }

    info!("padremapd running");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

/// Stands in for the configuration UI: enables a device as soon as its
/// hardware connects and logs everything the engines report.
fn subscribe_ui_boundary(
    bus: &Arc<EngineBus>,
    manager: Arc<HardwareManager>,
    profiles: HashMap<String, Profile>,
) {
    bus.add_listener(
        move |event: &EngineEvent| match event {
            EngineEvent::StatusChange {
                signature,
                connected: true,
            } => {
                info!(device = signature.as_str(), "connected");
                let profile = profiles.get(signature).cloned();
                if let Err(e) = manager.start_polling_device(signature, profile) {
                    error!(device = signature.as_str(), "cannot enable: {e}");
                }
            }
            EngineEvent::StatusChange { signature, .. } => {
                info!(device = signature.as_str(), "disconnected");
            }
            EngineEvent::KeymapChanged { signature, slot } => {
                debug!(device = signature.as_str(), slot, "keymap changed");
            }
        },
        EventFilter::All,
        None,
    );
}
