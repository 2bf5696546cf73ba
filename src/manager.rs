//! Hardware manager.
//!
//! Owns one [`HardwareEngine`] per managed device, keyed by the device's
//! hardware signature, and carries the shared [`EngineBus`] through which all
//! engines' status notifications reach the UI boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::info;

use crate::bus::EngineBus;
use crate::engine::HardwareEngine;
use crate::mapping::{ActiveProfile, Device, Profile, ProfileError};

/// User-facing validation failures when enabling a device.
#[derive(Debug, Error)]
pub enum EnableError {
    #[error("device {0} is not managed")]
    UnknownDevice(String),
    #[error("device {0} has no profile assigned")]
    NoProfile(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error(transparent)]
    InvalidProfile(#[from] ProfileError),
}

pub struct HardwareManager {
    engines: Mutex<HashMap<String, HardwareEngine>>,
    bus: Arc<EngineBus>,
}

impl HardwareManager {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            bus: Arc::new(EngineBus::new()),
        }
    }

    /// Bus every engine of this manager publishes on.
    pub fn bus(&self) -> Arc<EngineBus> {
        self.bus.clone()
    }

    fn lock_engines(&self) -> MutexGuard<'_, HashMap<String, HardwareEngine>> {
        self.engines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an engine for the device and starts its hardware scanning.
    /// Returns false when a device with the same signature is already
    /// managed.
    pub fn add_managed_device(&self, device: Arc<Device>) -> bool {
        let mut engines = self.lock_engines();
        let signature = device.signature().to_string();
        if engines.contains_key(&signature) {
            return false;
        }
        let mut engine = HardwareEngine::new(device, self.bus.clone());
        engine.start_scanning();
        info!(device = signature.as_str(), "device added");
        engines.insert(signature, engine);
        true
    }

    /// Stops and discards the device's engine. Returns false for an unknown
    /// signature.
    pub fn remove_device(&self, signature: &str) -> bool {
        let engine = self.lock_engines().remove(signature);
        match engine {
            Some(mut engine) => {
                engine.close();
                info!(device = signature, "device removed");
                true
            }
            None => false,
        }
    }

    pub fn is_device_managed(&self, signature: &str) -> bool {
        self.lock_engines().contains_key(signature)
    }

    /// Validates and enables the device, then starts its polling. The
    /// enabled state is left off when validation fails.
    ///
    /// Engine operations run on a detached handle: holding the registry lock
    /// across a polling-thread join could deadlock against a bus listener.
    pub fn start_polling_device(
        &self,
        signature: &str,
        profile: Option<Profile>,
    ) -> Result<(), EnableError> {
        let engine = self
            .engine_handle(signature)
            .ok_or_else(|| EnableError::UnknownDevice(signature.to_string()))?;
        let profile = profile.ok_or_else(|| EnableError::NoProfile(signature.to_string()))?;
        if !engine.device().is_connected() {
            return Err(EnableError::NotConnected(signature.to_string()));
        }
        let active = Arc::new(ActiveProfile::new(profile)?);

        engine.device().set_profile(Some(active.clone()));
        engine.device().set_enabled(true);
        engine.start_polling(Some(active));
        Ok(())
    }

    /// Stops polling, releases the grab and marks the device disabled.
    pub fn disable_device(&self, signature: &str) -> bool {
        let Some(engine) = self.engine_handle(signature) else {
            return false;
        };
        engine.device().set_enabled(false);
        engine.stop_polling();
        true
    }

    fn engine_handle(&self, signature: &str) -> Option<crate::engine::EngineHandle> {
        self.lock_engines().get(signature).map(|e| e.handle())
    }
}

impl Default for HardwareManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{DeviceInfo, Keymap};

    fn test_device(signature: &str) -> Arc<Device> {
        Arc::new(Device::new(DeviceInfo {
            name: "Test Pad".into(),
            signature: signature.into(),
            has_mouse: false,
        }))
    }

    fn one_slot_profile() -> Profile {
        Profile::new("p", vec![Keymap::empty(1)])
    }

    #[test]
    fn managed_device_lifecycle() {
        let manager = HardwareManager::new();
        let device = test_device("pad-a");

        assert!(!manager.is_device_managed("pad-a"));
        assert!(manager.add_managed_device(device.clone()));
        assert!(manager.is_device_managed("pad-a"));
        // same signature cannot be managed twice
        assert!(!manager.add_managed_device(device));

        assert!(manager.remove_device("pad-a"));
        assert!(!manager.is_device_managed("pad-a"));
        assert!(!manager.remove_device("pad-a"));
    }

    #[test]
    fn enabling_validates_profile_and_connection() {
        let manager = HardwareManager::new();
        let device = test_device("pad-b");
        manager.add_managed_device(device.clone());

        assert!(matches!(
            manager.start_polling_device("missing", Some(one_slot_profile())),
            Err(EnableError::UnknownDevice(_))
        ));
        assert!(matches!(
            manager.start_polling_device("pad-b", None),
            Err(EnableError::NoProfile(_))
        ));
        assert!(matches!(
            manager.start_polling_device("pad-b", Some(one_slot_profile())),
            Err(EnableError::NotConnected(_))
        ));
        assert!(!device.is_enabled());

        device.set_connected(true);
        let mut bad = one_slot_profile();
        bad.keymaps[0].id = 7;
        assert!(matches!(
            manager.start_polling_device("pad-b", Some(bad)),
            Err(EnableError::InvalidProfile(_))
        ));
        assert!(!device.is_enabled());

        // with no hardware attached this enables the device and leaves it idle
        manager
            .start_polling_device("pad-b", Some(one_slot_profile()))
            .unwrap();
        assert!(device.is_enabled());
        assert!(device.profile().is_some());

        assert!(manager.disable_device("pad-b"));
        assert!(!device.is_enabled());
    }
}
