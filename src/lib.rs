//! Input-remapping engine for programmable keypads.
//!
//! Scans for supported hardware, grabs it for exclusive access and translates
//! its raw events into synthesized keyboard, mouse and wheel output according
//! to a per-device profile of up to eight switchable keymaps.

pub mod bus;
pub mod controller;
pub mod engine;
pub mod event_queue;
pub mod inject;
pub mod key_allocator;
pub mod manager;
pub mod mapping;
pub mod poll_set;
pub mod scanner;
pub mod translate;

pub use bus::{EngineBus, EngineEvent, EngineListener, EventFilter};
pub use engine::HardwareEngine;
pub use manager::{EnableError, HardwareManager};
pub use mapping::{
    ActiveProfile, ButtonMapping, Device, DeviceInfo, Keymap, MouseKind, Output, Profile,
    ProfileError, WheelMapping, KEYMAP_SLOTS,
};
