//! Keymap and profile data model.
//!
//! A [`Profile`] carries up to [`KEYMAP_SLOTS`] keymaps plus the index of the
//! active slot. Profiles are plain serde values supplied by the configuration
//! layer; the engine works against the runtime [`ActiveProfile`] form whose
//! active-slot index is shared between the polling thread and the caller.
//!
//! Component names follow the evdev key naming (`"KEY_1"`, `"BTN_SIDE"`) with
//! the short axis names `"x"`/`"y"`/`"z"` for the pointer and wheel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Number of keymap slots in a profile.
pub const KEYMAP_SLOTS: usize = 8;

/// The remapped action a component resolves to. Exactly one variant per
/// mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
    /// Synthesize a key chord. `modifier` of 0 means no modifier.
    Key {
        keycode: u16,
        #[serde(default)]
        modifier: u16,
    },
    /// Synthesize a mouse action. For `Click`/`DoubleClick` the keycode is a
    /// button code; for `Wheel` it is the signed scroll amount.
    Mouse { kind: MouseKind, keycode: i32 },
    /// Activate another keymap slot (1-based, 1..=8).
    KeymapSwitch {
        target_slot: usize,
        #[serde(default)]
        switch_on_release: bool,
    },
    /// Component intentionally produces nothing.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseKind {
    Click,
    DoubleClick,
    Wheel,
}

/// Binds a physical component to an [`Output`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonMapping {
    pub component: String,
    pub output: Output,
}

/// Binding for one scroll-wheel direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WheelMapping {
    pub component: String,
    pub output: Output,
}

impl WheelMapping {
    pub fn disabled(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            output: Output::Disabled,
        }
    }
}

/// One mapping table within a profile. `id` is the 1-based slot id and is
/// stable once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keymap {
    pub id: usize,
    #[serde(default)]
    pub buttons: HashMap<String, ButtonMapping>,
    pub wheel_up: WheelMapping,
    pub wheel_down: WheelMapping,
}

impl Keymap {
    /// An empty keymap for the given slot: no button bindings, wheel disabled.
    pub fn empty(id: usize) -> Self {
        Self {
            id,
            buttons: HashMap::new(),
            wheel_up: WheelMapping::disabled("z"),
            wheel_down: WheelMapping::disabled("z"),
        }
    }

    pub fn button_mapping(&self, component: &str) -> Option<&ButtonMapping> {
        self.buttons.get(component)
    }

    pub fn bind(&mut self, component: impl Into<String>, output: Output) {
        let component = component.into();
        self.buttons.insert(
            component.clone(),
            ButtonMapping { component, output },
        );
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profile has {0} keymaps, the maximum is 8")]
    TooManySlots(usize),
    #[error("keymap in slot {slot} carries id {id}, expected {expected}")]
    SlotIdMismatch { slot: usize, id: usize, expected: usize },
    #[error("default keymap index {0} is out of range")]
    BadDefaultSlot(usize),
}

/// Mapping configuration for one device: up to eight keymaps and the index of
/// the active one. Metadata fields describe the profile to the configuration
/// layer and travel with it when cloned across devices of the same model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub last_updated: u64,
    #[serde(default)]
    pub default_keymap: usize,
    pub keymaps: Vec<Keymap>,
}

impl Profile {
    pub fn new(name: impl Into<String>, keymaps: Vec<Keymap>) -> Self {
        Self {
            name: name.into(),
            author: String::new(),
            info: String::new(),
            last_updated: 0,
            default_keymap: 0,
            keymaps,
        }
    }

    pub fn keymap(&self, slot: usize) -> Option<&Keymap> {
        self.keymaps.get(slot)
    }

    /// Deep clone under a new name, for sharing one configuration across
    /// several devices of the same model.
    pub fn clone_profile(&self, name: impl Into<String>) -> Profile {
        let mut profile = self.clone();
        profile.name = name.into();
        profile
    }

    /// Checks the slot invariants: at most eight keymaps, slot ids equal to
    /// position + 1, default index inside the populated range.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.keymaps.len() > KEYMAP_SLOTS {
            return Err(ProfileError::TooManySlots(self.keymaps.len()));
        }
        for (slot, keymap) in self.keymaps.iter().enumerate() {
            if keymap.id != slot + 1 {
                return Err(ProfileError::SlotIdMismatch {
                    slot,
                    id: keymap.id,
                    expected: slot + 1,
                });
            }
        }
        if self.default_keymap >= self.keymaps.len() {
            return Err(ProfileError::BadDefaultSlot(self.default_keymap));
        }
        Ok(())
    }
}

/// Runtime form of a [`Profile`].
///
/// The active-slot index is written by the polling thread on keymap switches
/// and read by the caller's thread; readers may observe a value that is stale
/// by at most one poll cycle.
#[derive(Debug)]
pub struct ActiveProfile {
    name: String,
    keymaps: Vec<Keymap>,
    default_keymap: AtomicUsize,
}

impl ActiveProfile {
    /// Validates and converts. The keymap vector keeps its slot order.
    pub fn new(profile: Profile) -> Result<Self, ProfileError> {
        profile.validate()?;
        Ok(Self {
            name: profile.name,
            keymaps: profile.keymaps,
            default_keymap: AtomicUsize::new(profile.default_keymap),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keymap(&self, slot: usize) -> Option<&Keymap> {
        self.keymaps.get(slot)
    }

    pub fn keymaps(&self) -> &[Keymap] {
        &self.keymaps
    }

    pub fn default_keymap(&self) -> usize {
        self.default_keymap.load(Ordering::Acquire)
    }

    pub fn set_default_keymap(&self, slot: usize) {
        self.default_keymap.store(slot, Ordering::Release);
    }
}

/// Identity of a supported device model. `signature` is the product name the
/// hardware reports through the input enumeration layer and is what the
/// scanner matches against. Some keypads carry no pointer section, in which
/// case `has_mouse` is false and no mouse controller is polled or grabbed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub signature: String,
    #[serde(default = "default_true")]
    pub has_mouse: bool,
}

fn default_true() -> bool {
    true
}

/// A managed device: identity plus the mutable state shared between the
/// configuration layer and the engine threads.
#[derive(Debug)]
pub struct Device {
    info: DeviceInfo,
    enabled: AtomicBool,
    connected: AtomicBool,
    profile: Mutex<Option<Arc<ActiveProfile>>>,
}

impl Device {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            enabled: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            profile: Mutex::new(None),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn signature(&self) -> &str {
        &self.info.signature
    }

    pub fn has_mouse(&self) -> bool {
        self.info.has_mouse
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn profile(&self) -> Option<Arc<ActiveProfile>> {
        self.profile.lock().ok().and_then(|p| p.clone())
    }

    pub fn set_profile(&self, profile: Option<Arc<ActiveProfile>>) {
        if let Ok(mut slot) = self.profile.lock() {
            *slot = profile;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_slot_profile() -> Profile {
        let mut first = Keymap::empty(1);
        first.bind(
            "KEY_1",
            Output::Key {
                keycode: 30,
                modifier: 0,
            },
        );
        let second = Keymap::empty(2);
        Profile::new("test", vec![first, second])
    }

    #[test]
    fn profile_serde_round_trip() {
        let profile = two_slot_profile();
        let json = serde_json::to_string(&profile).unwrap();
        let back: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile, back);
    }

    #[test]
    fn output_json_shape_is_tagged() {
        let output = Output::KeymapSwitch {
            target_slot: 3,
            switch_on_release: true,
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["type"], "keymap_switch");
        assert_eq!(json["target_slot"], 3);
    }

    #[test]
    fn validate_rejects_bad_slot_ids() {
        let mut profile = two_slot_profile();
        profile.keymaps[1].id = 5;
        assert_eq!(
            profile.validate(),
            Err(ProfileError::SlotIdMismatch {
                slot: 1,
                id: 5,
                expected: 2
            })
        );
    }

    #[test]
    fn validate_rejects_default_out_of_range() {
        let mut profile = two_slot_profile();
        profile.default_keymap = 2;
        assert_eq!(profile.validate(), Err(ProfileError::BadDefaultSlot(2)));
    }

    #[test]
    fn active_profile_index_is_shared() {
        let active = ActiveProfile::new(two_slot_profile()).unwrap();
        assert_eq!(active.default_keymap(), 0);
        active.set_default_keymap(1);
        assert_eq!(active.default_keymap(), 1);
        assert_eq!(active.keymap(1).unwrap().id, 2);
    }

    #[test]
    fn clone_profile_is_deep() {
        let profile = two_slot_profile();
        let mut copy = profile.clone_profile("copy");
        copy.keymaps[0].bind("KEY_2", Output::Disabled);
        assert!(profile.keymaps[0].button_mapping("KEY_2").is_none());
        assert_eq!(copy.name, "copy");
    }
}
