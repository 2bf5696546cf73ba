//! The set of controllers one engine polls.
//!
//! A [`PollSet`] bundles the keyboard controllers and optional mouse belonging
//! to one physical device together with a poller over their descriptors, so a
//! poll cycle waits for readiness instead of spinning. Controllers without a
//! descriptor (test fakes) are polled directly with a short pace.

use anyhow::{Context, Result as Anyhow};
use polling::{Events, PollMode, Poller};
use std::io;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::controller::Controller;
use crate::event_queue::PollEventQueue;
use crate::key_allocator::KeyAllocator;

/// Upper bound on poller subscriptions per device.
pub const KEY_CAPACITY: usize = 8;

/// Pace for controllers that have no descriptor to wait on.
const DIRECT_POLL_PACE: Duration = Duration::from_millis(1);

struct Entry {
    key: usize,
    controller: Box<dyn Controller>,
}

pub struct PollSet {
    keyboards: Vec<Entry>,
    mouse: Option<Entry>,
    poller: Option<Poller>,
    #[allow(dead_code)]
    keys: KeyAllocator,
}

/// Queues produced by one poll cycle, in controller order.
pub struct CycleQueues {
    pub keyboards: Vec<PollEventQueue>,
    pub mouse: Option<PollEventQueue>,
}

impl PollSet {
    pub fn new(
        keyboards: Vec<Box<dyn Controller>>,
        mouse: Option<Box<dyn Controller>>,
    ) -> Anyhow<Self> {
        let mut keys = KeyAllocator::new(KEY_CAPACITY);

        let all_have_fds = keyboards.iter().all(|c| c.raw_fd().is_some())
            && mouse.as_ref().map_or(true, |c| c.raw_fd().is_some());
        let poller = if all_have_fds {
            Some(Poller::new().with_context(|| "Failed to create the controller poller")?)
        } else {
            None
        };

        let mut register = |controller: Box<dyn Controller>,
                            keys: &mut KeyAllocator,
                            poller: &Option<Poller>|
         -> Anyhow<Entry> {
            let key = keys.allocate()?;
            if let (Some(poller), Some(fd)) = (poller, controller.raw_fd()) {
                unsafe {
                    poller
                        .add_with_mode(fd, polling::Event::readable(key), PollMode::Level)
                        .with_context(|| {
                            format!("Failed to subscribe controller {}", controller.name())
                        })?;
                }
            }
            Ok(Entry { key, controller })
        };

        let mut keyboard_entries = Vec::with_capacity(keyboards.len());
        for controller in keyboards {
            keyboard_entries.push(register(controller, &mut keys, &poller)?);
        }
        let mouse = match mouse {
            Some(controller) => Some(register(controller, &mut keys, &poller)?),
            None => None,
        };

        Ok(Self {
            keyboards: keyboard_entries,
            mouse,
            poller,
            keys,
        })
    }

    /// Runs one poll cycle: waits for readiness (bounded by `timeout`), then
    /// reads every ready controller. An I/O error from any controller is a
    /// poll failure and means the hardware is gone.
    pub fn poll_cycle(&mut self, timeout: Duration) -> io::Result<CycleQueues> {
        let ready = match &self.poller {
            Some(poller) => {
                let mut events = Events::new();
                poller.wait(&mut events, Some(timeout))?;
                let mut ready = [false; KEY_CAPACITY];
                for event in events.iter() {
                    if event.key < KEY_CAPACITY {
                        ready[event.key] = true;
                    }
                }
                Some(ready)
            }
            None => {
                thread::sleep(DIRECT_POLL_PACE);
                None
            }
        };

        let is_ready = |key: usize| ready.map_or(true, |r| r[key]);

        let mut keyboards = Vec::with_capacity(self.keyboards.len());
        for entry in &mut self.keyboards {
            if is_ready(entry.key) {
                keyboards.push(entry.controller.poll()?);
            } else {
                keyboards.push(PollEventQueue::new());
            }
        }
        let mouse = match &mut self.mouse {
            Some(entry) if is_ready(entry.key) => Some(entry.controller.poll()?),
            Some(_) => Some(PollEventQueue::new()),
            None => None,
        };

        Ok(CycleQueues { keyboards, mouse })
    }

    /// Takes exclusive access to every controller. The mouse is grabbed last,
    /// and only once no button is held: grabbing mid-click faults some
    /// drivers. The wait services poll reads so the release can be observed.
    pub fn grab(&mut self) -> io::Result<()> {
        for entry in &mut self.keyboards {
            entry.controller.grab()?;
        }
        if let Some(entry) = &mut self.mouse {
            while entry.controller.any_button_pressed()? {
                let _ = entry.controller.poll()?;
            }
            entry.controller.grab()?;
        }
        Ok(())
    }

    /// Releases exclusive access. Best effort: the hardware may already be
    /// gone, in which case the kernel released the grab with it.
    pub fn ungrab(&mut self) {
        for entry in &mut self.keyboards {
            if let Err(e) = entry.controller.ungrab() {
                debug!(controller = entry.controller.name(), "ungrab failed: {e}");
            }
        }
        if let Some(entry) = &mut self.mouse {
            if let Err(e) = entry.controller.ungrab() {
                debug!(controller = entry.controller.name(), "ungrab failed: {e}");
            }
        }
    }

    pub fn has_mouse(&self) -> bool {
        self.mouse.is_some()
    }
}
