//! Physical controller enumeration.
//!
//! The scanner walks the input subsystem through udev and classifies every
//! event node it can open. It performs no matching itself; the engine matches
//! the returned handles against its device signature.

use anyhow::{Context, Result as Anyhow};
use evdev::{EventType, Key};
use std::path::{Path, PathBuf};
use udev::Enumerator;

/// What role an input node plays for a managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    Keyboard,
    Mouse,
}

/// One enumerated input node.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    pub path: PathBuf,
    /// Product name the node reports; matched against device signatures.
    pub name: String,
    pub kind: ControllerKind,
}

/// Enumerates the input controllers currently visible to the OS.
///
/// A fresh environment query (`rescan = false`) rebuilds the udev enumerator;
/// the periodic hot-plug path passes `rescan = true` and re-queries the
/// existing one, which is the cheaper call.
pub struct DeviceScanner {
    enumerator: Option<Enumerator>,
}

impl DeviceScanner {
    pub fn new() -> Self {
        Self { enumerator: None }
    }

    pub fn scan(&mut self, rescan: bool) -> Anyhow<Vec<ControllerHandle>> {
        let enumerator = match &mut self.enumerator {
            Some(enumerator) if rescan => enumerator,
            slot => slot.insert(Self::build_enumerator()?),
        };

        let mut handles = Vec::new();
        for device in enumerator
            .scan_devices()
            .with_context(|| "Failed to scan the input subsystem")?
        {
            let Some(node) = device.devnode() else {
                continue;
            };
            if !is_event_node(node) {
                continue;
            }
            if let Some(handle) = Self::classify(node) {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    fn build_enumerator() -> Anyhow<Enumerator> {
        let mut enumerator =
            Enumerator::new().with_context(|| "Failed to create a udev enumerator")?;
        enumerator
            .match_subsystem("input")
            .with_context(|| "Failed to add a subsystem filter to the udev enumerator")?;
        Ok(enumerator)
    }

    /// Opens the node to read its identity and capability bits. Nodes that
    /// cannot be opened or expose neither keys nor a pointer are skipped.
    fn classify(path: &Path) -> Option<ControllerHandle> {
        let device = evdev::Device::open(path).ok()?;
        let name = device.name()?.to_string();
        let keys = device.supported_keys()?;

        let kind = if keys.contains(Key::BTN_LEFT)
            && device.supported_events().contains(EventType::RELATIVE)
        {
            ControllerKind::Mouse
        } else if keys.iter().any(|key| key.code() < 0x100) {
            ControllerKind::Keyboard
        } else {
            return None;
        };

        Some(ControllerHandle {
            path: path.to_path_buf(),
            name,
            kind,
        })
    }
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn is_event_node(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with("event"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_nodes_are_selected_by_name() {
        assert!(is_event_node(Path::new("/dev/input/event7")));
        assert!(!is_event_node(Path::new("/dev/input/mouse0")));
        assert!(!is_event_node(Path::new("/dev/input/js0")));
    }
}
