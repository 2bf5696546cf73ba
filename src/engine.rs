//! Per-device hardware engine.
//!
//! Each engine owns one managed device's lifecycle: periodic scanning for the
//! matching hardware, exclusive-access grabbing, the polling thread that
//! translates raw events into synthesized output, and disconnect recovery.
//!
//! The lifecycle is `NoHardware -> HardwareFound -> Polling` and back. The
//! state lives in a single atomic with compare-and-swap transitions; the
//! polling thread is stopped by joining its handle, never by spinning on a
//! flag.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::EngineBus;
use crate::controller::{Controller, EvdevController};
use crate::inject::UinputInjector;
use crate::mapping::{ActiveProfile, Device};
use crate::poll_set::PollSet;
use crate::scanner::{ControllerHandle, ControllerKind, DeviceScanner};
use crate::translate::OutputDispatcher;

/// Interval between hot-plug rescans.
pub const SLEEP_INTERVAL: Duration = Duration::from_millis(1000);
/// Upper bound one poll cycle waits for controller readiness.
const POLL_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    NoHardware = 0,
    HardwareFound = 1,
    Polling = 2,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: EngineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> EngineState {
        match self.0.load(Ordering::Acquire) {
            0 => EngineState::NoHardware,
            1 => EngineState::HardwareFound,
            _ => EngineState::Polling,
        }
    }

    fn store(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn swap(&self, state: EngineState) -> EngineState {
        match self.0.swap(state as u8, Ordering::AcqRel) {
            0 => EngineState::NoHardware,
            1 => EngineState::HardwareFound,
            _ => EngineState::Polling,
        }
    }

    /// Single CAS transition; false when another thread moved first.
    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// State shared between the engine handle, the scan thread and the polling
/// thread.
struct EngineShared {
    device: Arc<Device>,
    bus: Arc<EngineBus>,
    state: StateCell,
    stop_poll: AtomicBool,
    controllers: Mutex<Option<PollSet>>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EngineShared {
    fn new(device: Arc<Device>, bus: Arc<EngineBus>) -> Self {
        Self {
            device,
            bus,
            state: StateCell::new(EngineState::NoHardware),
            stop_poll: AtomicBool::new(false),
            controllers: Mutex::new(None),
            poll_thread: Mutex::new(None),
        }
    }

    fn lock_controllers(&self) -> MutexGuard<'_, Option<PollSet>> {
        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_poll_thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.poll_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// One scan pass: match the enumerated controllers against the device
    /// signature and drive the connect/disconnect transitions.
    fn scan_hardware(self: &Arc<Self>, scanner: &mut DeviceScanner, rescan: bool) {
        let handles = match scanner.scan(rescan) {
            Ok(handles) => handles,
            Err(e) => {
                warn!("Controller scan failed: {e:#}");
                return;
            }
        };
        let matched: Vec<ControllerHandle> = handles
            .into_iter()
            .filter(|handle| handle.name == self.device.signature())
            .collect();
        if matched.is_empty() {
            self.hardware_disconnected();
        } else {
            self.hardware_connected(&matched);
        }
    }

    fn hardware_connected(self: &Arc<Self>, handles: &[ControllerHandle]) {
        if self.state.load() != EngineState::NoHardware {
            return;
        }

        let mut keyboards: Vec<Box<dyn Controller>> = Vec::new();
        let mut mouse: Option<Box<dyn Controller>> = None;
        for handle in handles {
            match handle.kind {
                ControllerKind::Keyboard => match EvdevController::open(handle) {
                    Ok(controller) => keyboards.push(Box::new(controller)),
                    Err(e) => {
                        warn!(path = %handle.path.display(), "Failed to open controller: {e}");
                        return;
                    }
                },
                ControllerKind::Mouse if self.device.has_mouse() && mouse.is_none() => {
                    match EvdevController::open(handle) {
                        Ok(controller) => mouse = Some(Box::new(controller)),
                        Err(e) => {
                            warn!(path = %handle.path.display(), "Failed to open controller: {e}");
                            return;
                        }
                    }
                }
                ControllerKind::Mouse => {}
            }
        }
        if keyboards.is_empty() && mouse.is_none() {
            return;
        }

        let set = match PollSet::new(keyboards, mouse) {
            Ok(set) => set,
            Err(e) => {
                warn!("Failed to assemble the controller set: {e:#}");
                return;
            }
        };
        *self.lock_controllers() = Some(set);

        if !self.state.transition(EngineState::NoHardware, EngineState::HardwareFound) {
            return;
        }
        self.device.set_connected(true);
        info!(device = self.device.signature(), "hardware connected");
        self.bus.status_change(self.device.signature(), true);

        // a still-enabled device resumes polling on reconnect
        if self.device.is_enabled() && self.state.load() != EngineState::Polling {
            self.start_polling(self.device.profile());
        }
    }

    fn hardware_disconnected(self: &Arc<Self>) {
        if self.state.load() == EngineState::NoHardware {
            return;
        }
        self.stop_polling();
        // a concurrent poll failure may have completed the disconnect already
        if self.state.swap(EngineState::NoHardware) == EngineState::NoHardware {
            return;
        }
        self.lock_controllers().take();
        self.device.set_enabled(false);
        self.device.set_connected(false);
        info!(device = self.device.signature(), "hardware disconnected");
        self.bus.status_change(self.device.signature(), false);
    }

    /// Grabs the hardware and launches the polling thread. Passing no profile
    /// keeps the device idle. Restarts cleanly when already polling.
    fn start_polling(self: &Arc<Self>, profile: Option<Arc<ActiveProfile>>) {
        if self.state.load() == EngineState::Polling {
            self.stop_polling();
        }
        let Some(profile) = profile else {
            return;
        };
        let Some(mut set) = self.lock_controllers().take() else {
            return;
        };

        let injector = match UinputInjector::for_profile(&self.device.info().name, &profile) {
            Ok(injector) => Box::new(injector),
            Err(e) => {
                warn!("Failed to create the output device: {e:#}");
                *self.lock_controllers() = Some(set);
                return;
            }
        };
        let Some(dispatcher) = OutputDispatcher::new(
            profile,
            injector,
            self.bus.clone(),
            self.device.signature(),
        ) else {
            warn!(
                device = self.device.signature(),
                "profile's default keymap slot is not populated"
            );
            *self.lock_controllers() = Some(set);
            return;
        };
        if let Err(e) = set.grab() {
            warn!("Failed to grab the hardware: {e}");
            *self.lock_controllers() = Some(set);
            return;
        }

        self.stop_poll.store(false, Ordering::Release);
        self.state.store(EngineState::Polling);
        let shared = self.clone();
        let handle = thread::spawn(move || poll_thread_main(shared, set, dispatcher));
        *self.lock_poll_thread() = Some(handle);
    }

    /// Blocks until the polling thread has exited, then releases exclusive
    /// access. Releasing before the loop exits would free the device while
    /// the loop still holds its handle.
    fn stop_polling(self: &Arc<Self>) {
        self.stop_poll.store(true, Ordering::Release);
        let handle = self.lock_poll_thread().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        if let Some(set) = self.lock_controllers().as_mut() {
            set.ungrab();
        }
        self.state.transition(EngineState::Polling, EngineState::HardwareFound);
    }
}

/// Body of the polling thread. On a requested stop the controller set is
/// handed back for the stopper to ungrab; a poll failure is a disconnect and
/// is reported here, exactly once.
fn poll_thread_main(shared: Arc<EngineShared>, mut set: PollSet, mut dispatcher: OutputDispatcher) {
    let failed = run_poll_loop(&shared, &mut set, &mut dispatcher);
    if failed {
        set.ungrab();
        drop(set);
        if shared.state.swap(EngineState::NoHardware) != EngineState::NoHardware {
            shared.device.set_enabled(false);
            shared.device.set_connected(false);
            info!(device = shared.device.signature(), "hardware lost while polling");
            shared.bus.status_change(shared.device.signature(), false);
        }
    } else {
        *shared.lock_controllers() = Some(set);
    }
}

/// Returns true when the loop exited because of a poll failure.
fn run_poll_loop(
    shared: &EngineShared,
    set: &mut PollSet,
    dispatcher: &mut OutputDispatcher,
) -> bool {
    while !shared.stop_poll.load(Ordering::Acquire) {
        let cycle = match set.poll_cycle(POLL_WAIT) {
            Ok(cycle) => cycle,
            Err(e) => {
                debug!("poll failed: {e}");
                return true;
            }
        };
        // a disabled device is still polled, so disconnects are noticed, but
        // its events are drained without producing output
        if !shared.device.is_enabled() {
            continue;
        }
        for queue in &cycle.keyboards {
            for event in queue.events() {
                dispatcher.dispatch_keyboard_event(event);
            }
        }
        if let Some(queue) = &cycle.mouse {
            for event in queue.events() {
                dispatcher.dispatch_mouse_event(event);
            }
        }
    }
    false
}

/// Handle owning one device's scan thread and polling lifecycle.
pub struct HardwareEngine {
    shared: Arc<EngineShared>,
    scan_stop: Option<mpsc::Sender<()>>,
    scan_thread: Option<JoinHandle<()>>,
}

impl HardwareEngine {
    pub fn new(device: Arc<Device>, bus: Arc<EngineBus>) -> Self {
        Self {
            shared: Arc::new(EngineShared::new(device, bus)),
            scan_stop: None,
            scan_thread: None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    pub fn hardware_exists(&self) -> bool {
        self.shared.state.load() != EngineState::NoHardware
    }

    pub fn is_polling(&self) -> bool {
        self.shared.state.load() == EngineState::Polling
    }

    /// Runs one fresh scan, then rescans every [`SLEEP_INTERVAL`] on a
    /// dedicated thread until stopped.
    pub fn start_scanning(&mut self) {
        if self.scan_thread.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel::<()>();
        let shared = self.shared.clone();
        let handle = thread::spawn(move || {
            let mut scanner = DeviceScanner::new();
            shared.scan_hardware(&mut scanner, false);
            while let Err(mpsc::RecvTimeoutError::Timeout) = rx.recv_timeout(SLEEP_INTERVAL) {
                shared.scan_hardware(&mut scanner, true);
            }
        });
        self.scan_stop = Some(tx);
        self.scan_thread = Some(handle);
    }

    pub fn stop_scanning(&mut self) {
        // dropping the sender wakes the scan thread out of its timer wait
        self.scan_stop.take();
        if let Some(handle) = self.scan_thread.take() {
            let _ = handle.join();
        }
    }

    pub fn start_polling(&self, profile: Option<Arc<ActiveProfile>>) {
        self.shared.start_polling(profile);
    }

    pub fn stop_polling(&self) {
        self.shared.stop_polling();
    }

    /// Full teardown: scanning stopped, polling stopped, controllers
    /// released.
    pub fn close(&mut self) {
        self.stop_scanning();
        self.shared.stop_polling();
        self.shared.lock_controllers().take();
        self.shared.state.store(EngineState::NoHardware);
    }
}

impl Drop for HardwareEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cheap handle onto an engine's polling lifecycle. Lets the manager operate
/// on an engine without holding its registry lock across a thread join.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl HardwareEngine {
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }
}

impl EngineHandle {
    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    pub fn start_polling(&self, profile: Option<Arc<ActiveProfile>>) {
        self.shared.start_polling(profile);
    }

    pub fn stop_polling(&self) {
        self.shared.stop_polling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EngineEvent, EventFilter};
    use crate::controller::testing::FakeController;
    use crate::inject::Injector;
    use crate::mapping::{DeviceInfo, Keymap, Output, Profile};
    use crate::scanner::ControllerKind;
    use std::io;

    struct NullInjector;

    impl Injector for NullInjector {
        fn key_press(&mut self, _: u16) -> io::Result<()> {
            Ok(())
        }
        fn key_release(&mut self, _: u16) -> io::Result<()> {
            Ok(())
        }
        fn button_press(&mut self, _: u16) -> io::Result<()> {
            Ok(())
        }
        fn button_release(&mut self, _: u16) -> io::Result<()> {
            Ok(())
        }
        fn wheel(&mut self, _: i32) -> io::Result<()> {
            Ok(())
        }
        fn pointer_position(&mut self) -> (i32, i32) {
            (0, 0)
        }
        fn move_pointer(&mut self, _: i32, _: i32) -> io::Result<()> {
            Ok(())
        }
        fn delay(&mut self, _: u64) {}
    }

    fn test_device(enabled: bool) -> Arc<Device> {
        let device = Device::new(DeviceInfo {
            name: "Test Pad".into(),
            signature: "test-pad".into(),
            has_mouse: true,
        });
        device.set_enabled(enabled);
        device.set_connected(true);
        Arc::new(device)
    }

    fn test_dispatcher(bus: Arc<EngineBus>) -> OutputDispatcher {
        let mut keymap = Keymap::empty(1);
        keymap.bind(
            "KEY_1",
            Output::Key {
                keycode: 30,
                modifier: 0,
            },
        );
        let profile = Arc::new(ActiveProfile::new(Profile::new("p", vec![keymap])).unwrap());
        OutputDispatcher::new(profile, Box::new(NullInjector), bus, "test-pad").unwrap()
    }

    fn status_log(bus: &EngineBus) -> Arc<Mutex<Vec<bool>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        bus.add_listener(
            move |event: &EngineEvent| {
                if let EngineEvent::StatusChange { connected, .. } = event {
                    sink.lock().unwrap().push(*connected);
                }
            },
            EventFilter::StatusOnly,
            None,
        );
        log
    }

    #[test]
    fn poll_failure_completes_a_disconnect() {
        let bus = Arc::new(EngineBus::new());
        let statuses = status_log(&bus);
        let shared = Arc::new(EngineShared::new(test_device(true), bus.clone()));
        shared.state.store(EngineState::Polling);

        let mut keyboard = FakeController::new("kb", ControllerKind::Keyboard);
        keyboard.push_batch(vec![]);
        keyboard.push_failure();
        let kb_state = keyboard.state_handle();
        let mut set = PollSet::new(vec![Box::new(keyboard)], None).unwrap();
        set.grab().unwrap();

        poll_thread_main(shared.clone(), set, test_dispatcher(bus));

        assert_eq!(shared.state.load(), EngineState::NoHardware);
        assert!(!shared.device.is_enabled());
        assert!(!shared.device.is_connected());
        assert!(!kb_state.lock().unwrap().grabbed);
        // exactly one notification, and it reports the loss
        assert_eq!(*statuses.lock().unwrap(), vec![false]);
    }

    #[test]
    fn requested_stop_returns_the_controller_set() {
        let bus = Arc::new(EngineBus::new());
        let statuses = status_log(&bus);
        let shared = Arc::new(EngineShared::new(test_device(true), bus.clone()));
        shared.state.store(EngineState::Polling);
        shared.stop_poll.store(true, Ordering::Release);

        let keyboard = FakeController::new("kb", ControllerKind::Keyboard);
        let set = PollSet::new(vec![Box::new(keyboard)], None).unwrap();

        poll_thread_main(shared.clone(), set, test_dispatcher(bus));

        assert!(shared.lock_controllers().is_some());
        assert_eq!(shared.state.load(), EngineState::Polling);
        assert!(statuses.lock().unwrap().is_empty());
    }

    #[test]
    fn disabled_device_drains_events_without_dispatching() {
        let bus = Arc::new(EngineBus::new());
        let shared = Arc::new(EngineShared::new(test_device(false), bus.clone()));
        shared.state.store(EngineState::Polling);

        let mut keyboard = FakeController::new("kb", ControllerKind::Keyboard);
        keyboard.push_batch(vec![crate::event_queue::RawEvent::new("KEY_1", 1)]);
        keyboard.push_failure(); // ends the loop after the drained batch
        let mut set = PollSet::new(vec![Box::new(keyboard)], None).unwrap();

        // KEY_1 switches keymaps, so a dispatched event would be observable
        let mut keymap = Keymap::empty(1);
        keymap.bind(
            "KEY_1",
            Output::KeymapSwitch {
                target_slot: 2,
                switch_on_release: false,
            },
        );
        let profile = Arc::new(
            ActiveProfile::new(Profile::new("p", vec![keymap, Keymap::empty(2)])).unwrap(),
        );
        let mut dispatcher = OutputDispatcher::new(
            profile.clone(),
            Box::new(NullInjector),
            bus,
            "test-pad",
        )
        .unwrap();

        let failed = run_poll_loop(&shared, &mut set, &mut dispatcher);
        assert!(failed);
        assert_eq!(profile.default_keymap(), 0);
    }

    #[test]
    fn start_polling_without_profile_is_a_no_op() {
        let bus = Arc::new(EngineBus::new());
        let engine = HardwareEngine::new(test_device(true), bus);
        engine.start_polling(None);
        assert!(!engine.is_polling());
        engine.stop_polling();
    }
}
