//! Per-poll-cycle event buffering.
//!
//! A [`PollEventQueue`] holds the raw events one controller produced during a
//! single poll cycle. It is filled by a [`Controller`](crate::controller::Controller)
//! poll, consumed immediately by the translation loop, then discarded.

/// One raw hardware event, already reduced to the component-name convention
/// the keymaps are written against.
///
/// For key-type components the name is the evdev key name (`"KEY_1"`,
/// `"BTN_SIDE"`, ...). Relative pointer axes use the short names `"x"`, `"y"`
/// and `"z"` (the scroll wheel).
///
/// `value` is `1` for press, `0` for release and `2` for key repeat. Wheel
/// events carry a signed magnitude instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub component: String,
    pub value: i32,
}

impl RawEvent {
    pub fn new(component: impl Into<String>, value: i32) -> Self {
        Self {
            component: component.into(),
            value,
        }
    }
}

/// Ordered events from one controller for one poll cycle.
#[derive(Debug, Default)]
pub struct PollEventQueue {
    events: Vec<RawEvent>,
}

impl PollEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: RawEvent) {
        self.events.push(event);
    }

    /// Events in the order the underlying poll call returned them.
    pub fn events(&self) -> &[RawEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

impl FromIterator<RawEvent> for PollEventQueue {
    fn from_iter<I: IntoIterator<Item = RawEvent>>(iter: I) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_preserves_order() {
        let mut queue = PollEventQueue::new();
        queue.push(RawEvent::new("KEY_1", 1));
        queue.push(RawEvent::new("KEY_2", 1));
        queue.push(RawEvent::new("KEY_1", 0));

        let names: Vec<_> = queue.events().iter().map(|e| e.component.as_str()).collect();
        assert_eq!(names, ["KEY_1", "KEY_2", "KEY_1"]);
    }
}
