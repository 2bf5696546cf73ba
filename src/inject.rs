//! Synthetic input injection.
//!
//! [`Injector`] is the seam between output dispatch and the OS input-injection
//! facility. The production implementation emits through an evdev uinput
//! virtual device; tests substitute a recording implementation.

use anyhow::{Context, Result as Anyhow};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key, RelativeAxisType};
use std::io;
use std::thread;
use std::time::Duration;

use crate::mapping::{ActiveProfile, MouseKind, Output};

/// Target of synthesized key, pointer and wheel actions.
pub trait Injector: Send {
    fn key_press(&mut self, keycode: u16) -> io::Result<()>;
    fn key_release(&mut self, keycode: u16) -> io::Result<()>;
    fn button_press(&mut self, keycode: u16) -> io::Result<()>;
    fn button_release(&mut self, keycode: u16) -> io::Result<()>;
    /// Scrolls by the signed amount (positive is up).
    fn wheel(&mut self, amount: i32) -> io::Result<()>;
    /// Current pointer location as the injector tracks it.
    fn pointer_position(&mut self) -> (i32, i32);
    /// Moves the pointer to the given location. Coordinates are passed
    /// through as-is; out-of-bounds targets are not clamped.
    fn move_pointer(&mut self, x: i32, y: i32) -> io::Result<()>;
    /// Pause between the steps of a synthesized sequence.
    fn delay(&mut self, millis: u64) {
        thread::sleep(Duration::from_millis(millis));
    }
}

/// Injector backed by a uinput virtual device.
///
/// The virtual device registers exactly the key and button codes the profile's
/// outputs can produce, plus the relative pointer and wheel axes. Pointer
/// position is tracked locally and replayed as relative moves.
pub struct UinputInjector {
    device: VirtualDevice,
    pointer: (i32, i32),
}

impl UinputInjector {
    pub fn for_profile(name: &str, profile: &ActiveProfile) -> Anyhow<Self> {
        let mut keys: AttributeSet<Key> = AttributeSet::new();
        for output in profile_outputs(profile) {
            match output {
                Output::Key { keycode, modifier } => {
                    keys.insert(Key::new(*keycode));
                    if *modifier != 0 {
                        keys.insert(Key::new(*modifier));
                    }
                }
                Output::Mouse { kind, keycode } => {
                    if !matches!(kind, MouseKind::Wheel) && *keycode >= 0 {
                        keys.insert(Key::new(*keycode as u16));
                    }
                }
                Output::KeymapSwitch { .. } | Output::Disabled => {}
            }
        }

        let mut axes: AttributeSet<RelativeAxisType> = AttributeSet::new();
        axes.insert(RelativeAxisType::REL_X);
        axes.insert(RelativeAxisType::REL_Y);
        axes.insert(RelativeAxisType::REL_WHEEL);

        let device = VirtualDeviceBuilder::new()
            .with_context(|| "Failed to create the uinput builder")?
            .name(name)
            .with_keys(&keys)
            .with_context(|| "Failed to register key capabilities")?
            .with_relative_axes(&axes)
            .with_context(|| "Failed to register relative axis capabilities")?
            .build()
            .with_context(|| "Failed to create the virtual output device")?;

        Ok(Self {
            device,
            pointer: (0, 0),
        })
    }

    fn emit_key(&mut self, keycode: u16, value: i32) -> io::Result<()> {
        self.device
            .emit(&[InputEvent::new(EventType::KEY, keycode, value)])
    }
}

impl Injector for UinputInjector {
    fn key_press(&mut self, keycode: u16) -> io::Result<()> {
        self.emit_key(keycode, 1)
    }

    fn key_release(&mut self, keycode: u16) -> io::Result<()> {
        self.emit_key(keycode, 0)
    }

    fn button_press(&mut self, keycode: u16) -> io::Result<()> {
        self.emit_key(keycode, 1)
    }

    fn button_release(&mut self, keycode: u16) -> io::Result<()> {
        self.emit_key(keycode, 0)
    }

    fn wheel(&mut self, amount: i32) -> io::Result<()> {
        self.device.emit(&[InputEvent::new(
            EventType::RELATIVE,
            RelativeAxisType::REL_WHEEL.0,
            amount,
        )])
    }

    fn pointer_position(&mut self) -> (i32, i32) {
        self.pointer
    }

    fn move_pointer(&mut self, x: i32, y: i32) -> io::Result<()> {
        let dx = x - self.pointer.0;
        let dy = y - self.pointer.1;
        let mut events = Vec::with_capacity(2);
        if dx != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_X.0,
                dx,
            ));
        }
        if dy != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_Y.0,
                dy,
            ));
        }
        if !events.is_empty() {
            self.device.emit(&events)?;
        }
        self.pointer = (x, y);
        Ok(())
    }
}

fn profile_outputs(profile: &ActiveProfile) -> impl Iterator<Item = &Output> {
    profile.keymaps().iter().flat_map(|keymap| {
        keymap
            .buttons
            .values()
            .map(|mapping| &mapping.output)
            .chain([&keymap.wheel_up.output, &keymap.wheel_down.output])
    })
}
