//! Engine notification bus.
//!
//! Engines publish hardware status changes and keymap switches here instead of
//! holding a reference to any UI type; the UI boundary subscribes. Publishing
//! takes the listener lock, which is what serializes concurrent notifications
//! from several engines' scanning and polling threads.
//!
//! Listeners run under that lock: keep them short and forward heavy work to
//! another thread. In particular a listener must not stop or restart polling
//! for a device that is currently polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Notification published by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Hardware matching `signature` appeared or went away.
    StatusChange { signature: String, connected: bool },
    /// The active keymap slot (0-based) changed for the device's profile.
    KeymapChanged { signature: String, slot: usize },
}

impl EngineEvent {
    pub fn signature(&self) -> &str {
        match self {
            EngineEvent::StatusChange { signature, .. } => signature,
            EngineEvent::KeymapChanged { signature, .. } => signature,
        }
    }
}

/// Which events a listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    StatusOnly,
    KeymapOnly,
}

impl EventFilter {
    fn passes(self, event: &EngineEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::StatusOnly => matches!(event, EngineEvent::StatusChange { .. }),
            EventFilter::KeymapOnly => matches!(event, EngineEvent::KeymapChanged { .. }),
        }
    }
}

pub trait EngineListener: Send {
    fn on_event(&mut self, event: &EngineEvent);
}

impl<F> EngineListener for F
where
    F: FnMut(&EngineEvent) + Send,
{
    fn on_event(&mut self, event: &EngineEvent) {
        self(event)
    }
}

struct ListenerEntry {
    listener: Box<dyn EngineListener>,
    enabled: bool,
    filter: EventFilter,
    /// When set, only events for this device signature are delivered.
    signature: Option<String>,
}

/// Listener registry shared by all engines of a manager.
#[derive(Default)]
pub struct EngineBus {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, ListenerEntry>>,
}

impl EngineBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(
        &self,
        listener: impl EngineListener + 'static,
        filter: EventFilter,
        signature: Option<String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(
                id,
                ListenerEntry {
                    listener: Box::new(listener),
                    enabled: true,
                    filter,
                    signature,
                },
            );
        }
        id
    }

    pub fn remove_listener(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(&id);
        }
    }

    /// Mutes a listener without removing it.
    pub fn set_enabled(&self, id: u64, enabled: bool) {
        if let Ok(mut listeners) = self.listeners.lock() {
            if let Some(entry) = listeners.get_mut(&id) {
                entry.enabled = enabled;
            }
        }
    }

    /// Delivers one event to every active, matching listener. Best effort: a
    /// bus with no interested listeners is not an error.
    pub fn publish(&self, event: &EngineEvent) {
        let Ok(mut listeners) = self.listeners.lock() else {
            return;
        };
        for entry in listeners.values_mut() {
            if !entry.enabled {
                continue;
            }
            if let Some(wanted) = &entry.signature {
                if wanted != event.signature() {
                    continue;
                }
            }
            if entry.filter.passes(event) {
                entry.listener.on_event(event);
            }
        }
    }

    pub fn status_change(&self, signature: &str, connected: bool) {
        self.publish(&EngineEvent::StatusChange {
            signature: signature.to_string(),
            connected,
        });
    }

    pub fn keymap_changed(&self, signature: &str, slot: usize) {
        self.publish(&EngineEvent::KeymapChanged {
            signature: signature.to_string(),
            slot,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn collect(bus: &EngineBus, filter: EventFilter, signature: Option<&str>) -> Arc<Mutex<Vec<EngineEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        bus.add_listener(
            move |event: &EngineEvent| sink.lock().unwrap().push(event.clone()),
            filter,
            signature.map(str::to_string),
        );
        log
    }

    #[test]
    fn filter_and_signature_select_events() {
        let bus = EngineBus::new();
        let status = collect(&bus, EventFilter::StatusOnly, None);
        let keymap_n52 = collect(&bus, EventFilter::KeymapOnly, Some("n52"));

        bus.status_change("n52", true);
        bus.keymap_changed("n52", 2);
        bus.keymap_changed("g13", 1);

        assert_eq!(status.lock().unwrap().len(), 1);
        let keymaps = keymap_n52.lock().unwrap();
        assert_eq!(
            *keymaps,
            vec![EngineEvent::KeymapChanged {
                signature: "n52".into(),
                slot: 2
            }]
        );
    }

    #[test]
    fn disabled_listener_is_skipped() {
        let bus = EngineBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let id = bus.add_listener(
            move |event: &EngineEvent| sink.lock().unwrap().push(event.clone()),
            EventFilter::All,
            None,
        );

        bus.set_enabled(id, false);
        bus.status_change("n52", false);
        assert!(log.lock().unwrap().is_empty());

        bus.set_enabled(id, true);
        bus.status_change("n52", false);
        assert_eq!(log.lock().unwrap().len(), 1);

        bus.remove_listener(id);
        bus.status_change("n52", true);
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
