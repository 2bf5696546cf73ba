//! Event-to-output translation.
//!
//! The [`OutputDispatcher`] owns the polling thread's view of the active
//! keymap, the switch-on-release state machine, and the per-variant dispatch
//! semantics. It re-resolves the active keymap per event when the profile's
//! default-keymap index has changed, so a keymap hot-swap takes effect on the
//! next event rather than mid-batch.

use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bus::EngineBus;
use crate::event_queue::RawEvent;
use crate::inject::Injector;
use crate::mapping::{ActiveProfile, Keymap, MouseKind, Output, KEYMAP_SLOTS};

/// Gap between the press and release of a pulsed wheel binding. Wheel
/// hardware never sends a release event, so key-like wheel outputs are
/// synthesized as a short tap.
const WHEEL_PULSE_MS: u64 = 10;
/// Spacing between the four actions of a synthesized double click.
const DOUBLE_CLICK_SPACING_MS: u64 = 10;

/// Restore target recorded while a switch-on-release is pending.
struct PendingSwitch {
    previous: Keymap,
    component: String,
}

pub struct OutputDispatcher {
    profile: Arc<ActiveProfile>,
    keymap: Keymap,
    pending: Option<PendingSwitch>,
    injector: Box<dyn Injector>,
    bus: Arc<EngineBus>,
    signature: String,
}

impl OutputDispatcher {
    /// Resolves the initial keymap from the profile's default slot. Returns
    /// `None` when that slot is not populated.
    pub fn new(
        profile: Arc<ActiveProfile>,
        injector: Box<dyn Injector>,
        bus: Arc<EngineBus>,
        signature: &str,
    ) -> Option<Self> {
        let keymap = profile.keymap(profile.default_keymap())?.clone();
        Some(Self {
            profile,
            keymap,
            pending: None,
            injector,
            bus,
            signature: signature.to_string(),
        })
    }

    /// True while a switch-on-release is waiting for its matching release.
    pub fn switch_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Handles one event from a keyboard controller. A component with no
    /// binding in the active keymap is a silent no-op.
    pub fn dispatch_keyboard_event(&mut self, event: &RawEvent) {
        self.refresh_keymap();
        let Some(output) = self
            .keymap
            .button_mapping(&event.component)
            .map(|mapping| mapping.output.clone())
        else {
            return;
        };
        self.process_output(&event.component, output, event.value);
    }

    /// Handles one event from the mouse controller. The X and Y axes are
    /// pointer deltas; Z is the scroll wheel; anything else falls back to the
    /// button-mapping table.
    pub fn dispatch_mouse_event(&mut self, event: &RawEvent) {
        self.refresh_keymap();
        match event.component.as_str() {
            "x" => {
                let (x, y) = self.injector.pointer_position();
                // Target coordinates are passed through as-is, never clamped
                // to screen bounds.
                let result = self.injector.move_pointer(x + event.value, y);
                check("pointer move", result);
            }
            "y" => {
                let (x, y) = self.injector.pointer_position();
                let result = self.injector.move_pointer(x, y + event.value);
                check("pointer move", result);
            }
            "z" if event.value >= 1 => {
                let output = self.keymap.wheel_up.output.clone();
                let component = self.keymap.wheel_up.component.clone();
                self.process_wheel(&component, output, event.value);
            }
            "z" if event.value <= -1 => {
                let output = self.keymap.wheel_down.output.clone();
                let component = self.keymap.wheel_down.component.clone();
                self.process_wheel(&component, output, event.value);
            }
            "z" => {
                // wheel release carries no semantic
            }
            _ => {
                let Some(output) = self
                    .keymap
                    .button_mapping(&event.component)
                    .map(|mapping| mapping.output.clone())
                else {
                    return;
                };
                self.process_output(&event.component, output, event.value);
            }
        }
    }

    /// Wheel bindings that resolve to a key or keymap switch are pulsed,
    /// since the hardware never sends a wheel release. Everything else sees
    /// the raw signed value.
    fn process_wheel(&mut self, component: &str, output: Output, value: i32) {
        match output {
            Output::Key { .. } | Output::KeymapSwitch { .. } => {
                self.process_output(component, output.clone(), 1);
                self.injector.delay(WHEEL_PULSE_MS);
                self.process_output(component, output, 0);
            }
            other => self.process_output(component, other, value),
        }
    }

    fn process_output(&mut self, component: &str, output: Output, value: i32) {
        // A pending switch-on-release resolves before anything else and
        // short-circuits the rest of dispatch for the matching release.
        if value == 0 && self.pending.as_ref().is_some_and(|p| p.component == component) {
            if let Some(pending) = self.pending.take() {
                let slot = pending.previous.id - 1;
                self.profile.set_default_keymap(slot);
                self.bus.keymap_changed(&self.signature, slot);
            }
            return;
        }

        match output {
            Output::Key { keycode, modifier } => match value {
                1 => {
                    // modifier press precedes the key press
                    if modifier != 0 {
                        check("modifier press", self.injector.key_press(modifier));
                    }
                    check("key press", self.injector.key_press(keycode));
                }
                0 => {
                    // modifier release follows the key release
                    check("key release", self.injector.key_release(keycode));
                    if modifier != 0 {
                        check("modifier release", self.injector.key_release(modifier));
                    }
                }
                _ => {
                    // 2 is a key repeat; repeats never re-trigger side effects
                }
            },
            Output::Mouse { kind, keycode } => self.process_mouse(kind, keycode, value),
            Output::KeymapSwitch {
                target_slot,
                switch_on_release,
            } => {
                if target_slot < 1 || target_slot > KEYMAP_SLOTS {
                    return;
                }
                // no new switches while one is waiting for its release
                if self.pending.is_some() {
                    return;
                }
                if value == 1 {
                    if switch_on_release {
                        self.pending = Some(PendingSwitch {
                            previous: self.keymap.clone(),
                            component: component.to_string(),
                        });
                    }
                    self.profile.set_default_keymap(target_slot - 1);
                    self.bus.keymap_changed(&self.signature, target_slot - 1);
                }
            }
            Output::Disabled => {}
        }
    }

    fn process_mouse(&mut self, kind: MouseKind, keycode: i32, value: i32) {
        match kind {
            MouseKind::Click => {
                let Ok(code) = u16::try_from(keycode) else {
                    return;
                };
                if value == 1 {
                    check("button press", self.injector.button_press(code));
                } else if value == 0 {
                    check("button release", self.injector.button_release(code));
                }
            }
            MouseKind::DoubleClick => {
                let Ok(code) = u16::try_from(keycode) else {
                    return;
                };
                // fully synthesized on press; the release event is ignored
                if value == 1 {
                    check("double click", self.injector.button_press(code));
                    self.injector.delay(DOUBLE_CLICK_SPACING_MS);
                    check("double click", self.injector.button_release(code));
                    self.injector.delay(DOUBLE_CLICK_SPACING_MS);
                    check("double click", self.injector.button_press(code));
                    self.injector.delay(DOUBLE_CLICK_SPACING_MS);
                    check("double click", self.injector.button_release(code));
                }
            }
            MouseKind::Wheel => {
                check("wheel scroll", self.injector.wheel(keycode));
            }
        }
    }

    /// Picks up an external or switch-triggered change of the profile's
    /// default slot. Resolution happens per event, not per batch.
    fn refresh_keymap(&mut self) {
        let slot = self.profile.default_keymap();
        if slot != self.keymap.id - 1 {
            match self.profile.keymap(slot) {
                Some(keymap) => self.keymap = keymap.clone(),
                None => debug!(slot, "default keymap slot is not populated"),
            }
        }
    }
}

/// Injection failures are logged and never stop the polling loop.
fn check(what: &str, result: io::Result<()>) {
    if let Err(e) = result {
        warn!("Failed to synthesize {what}: {e}");
    }
}
