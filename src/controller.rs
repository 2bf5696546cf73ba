//! Pollable physical controllers.
//!
//! [`Controller`] abstracts one OS input node belonging to a managed device:
//! it can be polled for a batch of raw events, grabbed for exclusive access,
//! and asked whether any of its buttons is currently held. The production
//! implementation wraps an evdev device; the engine tests use fakes.

use evdev::{InputEventKind, Key, RelativeAxisType};
use std::io;
use std::os::fd::{AsRawFd, RawFd};

use crate::event_queue::{PollEventQueue, RawEvent};
use crate::scanner::{ControllerHandle, ControllerKind};

// Mouse button codes live in the BTN_MISC..BTN_DIGI range.
const BTN_RANGE: std::ops::Range<u16> = 0x110..0x160;

pub trait Controller: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> ControllerKind;

    /// Reads all events buffered since the last poll. An empty queue is a
    /// normal result; an error means the hardware is gone.
    fn poll(&mut self) -> io::Result<PollEventQueue>;

    fn grab(&mut self) -> io::Result<()>;
    fn ungrab(&mut self) -> io::Result<()>;

    /// True if any button on this controller is currently held down.
    fn any_button_pressed(&self) -> io::Result<bool> {
        Ok(false)
    }

    /// File descriptor for readiness waiting, when the controller has one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// A physical controller backed by an evdev device node.
pub struct EvdevController {
    device: evdev::Device,
    name: String,
    kind: ControllerKind,
}

impl EvdevController {
    pub fn open(handle: &ControllerHandle) -> io::Result<Self> {
        let device = evdev::Device::open(&handle.path)?;
        Ok(Self {
            device,
            name: handle.name.clone(),
            kind: handle.kind,
        })
    }
}

impl Controller for EvdevController {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ControllerKind {
        self.kind
    }

    fn poll(&mut self) -> io::Result<PollEventQueue> {
        let mut queue = PollEventQueue::new();
        let events = match self.device.fetch_events() {
            Ok(events) => events,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(queue),
            Err(e) => return Err(e),
        };
        for event in events {
            match event.kind() {
                InputEventKind::Key(key) => {
                    queue.push(RawEvent::new(format!("{key:?}"), event.value()));
                }
                InputEventKind::RelAxis(axis) => {
                    let component = match axis {
                        RelativeAxisType::REL_X => "x",
                        RelativeAxisType::REL_Y => "y",
                        RelativeAxisType::REL_WHEEL => "z",
                        _ => continue,
                    };
                    queue.push(RawEvent::new(component, event.value()));
                }
                _ => {}
            }
        }
        Ok(queue)
    }

    fn grab(&mut self) -> io::Result<()> {
        self.device.grab()
    }

    fn ungrab(&mut self) -> io::Result<()> {
        self.device.ungrab()
    }

    fn any_button_pressed(&self) -> io::Result<bool> {
        let held = self.device.get_key_state()?;
        Ok(held.iter().any(|key: Key| BTN_RANGE.contains(&key.code())))
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.device.as_raw_fd())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted controllers for poll-loop and grab tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct FakeState {
        pub grabbed: bool,
        pub grab_calls: usize,
        pub ungrab_calls: usize,
        pub polls: usize,
        /// Number of polls a button stays held before it reads as released.
        pub held_polls: usize,
    }

    pub struct FakeController {
        name: String,
        kind: ControllerKind,
        scripts: VecDeque<io::Result<Vec<RawEvent>>>,
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeController {
        pub fn new(name: &str, kind: ControllerKind) -> Self {
            Self {
                name: name.to_string(),
                kind,
                scripts: VecDeque::new(),
                state: Arc::new(Mutex::new(FakeState::default())),
            }
        }

        pub fn push_batch(&mut self, events: Vec<RawEvent>) {
            self.scripts.push_back(Ok(events));
        }

        pub fn push_failure(&mut self) {
            self.scripts
                .push_back(Err(io::Error::new(io::ErrorKind::Other, "device gone")));
        }

        pub fn hold_button_for(&mut self, polls: usize) {
            self.state.lock().unwrap().held_polls = polls;
        }

        pub fn state_handle(&self) -> Arc<Mutex<FakeState>> {
            self.state.clone()
        }
    }

    impl Controller for FakeController {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> ControllerKind {
            self.kind
        }

        fn poll(&mut self) -> io::Result<PollEventQueue> {
            let mut state = self.state.lock().unwrap();
            state.polls += 1;
            if state.held_polls > 0 {
                state.held_polls -= 1;
            }
            drop(state);
            match self.scripts.pop_front() {
                Some(Ok(events)) => Ok(events.into_iter().collect()),
                Some(Err(e)) => Err(e),
                None => Ok(PollEventQueue::new()),
            }
        }

        fn grab(&mut self) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.grab_calls += 1;
            state.grabbed = true;
            Ok(())
        }

        fn ungrab(&mut self) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.ungrab_calls += 1;
            state.grabbed = false;
            Ok(())
        }

        fn any_button_pressed(&self) -> io::Result<bool> {
            Ok(self.state.lock().unwrap().held_polls > 0)
        }
    }
}
