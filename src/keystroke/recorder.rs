//! Build a keystroke log from raw key down/up timings.
//!
//! Hands are assigned by the QWERTY half a key sits on. Latency and direction
//! are measured from the previous key down; hold time is filled in when the
//! key is released.

use crate::keystroke::types::{Direction, Hand, KeystrokeEvent};
use std::collections::HashMap;

/// Keys typed with the left hand on a QWERTY layout.
const LEFT_HAND_KEYS: &str = "qwertasdfgzxcvb";

/// Named keys that are recorded in addition to single characters.
const RECORDED_NAMED_KEYS: [&str; 1] = ["Backspace"];

/// Accumulates keystroke events for one typing session.
#[derive(Debug, Default)]
pub struct KeystrokeRecorder {
    events: Vec<KeystrokeEvent>,
    /// Press time of keys currently held down
    pressed: HashMap<String, f64>,
    /// Hand and time of the most recent key down
    last_down: Option<(Hand, f64)>,
}

impl KeystrokeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand used for a key on a QWERTY layout. Anything but a single
    /// left-half character is right-handed.
    pub fn hand_for(key: &str) -> Hand {
        let mut chars = key.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if LEFT_HAND_KEYS.contains(c.to_ascii_lowercase()) => Hand::L,
            _ => Hand::R,
        }
    }

    fn is_recorded(key: &str) -> bool {
        key.chars().count() == 1 || RECORDED_NAMED_KEYS.contains(&key)
    }

    /// Record a key down at `at_ms`. Returns false if the key is not tracked.
    ///
    /// Auto-repeat downs are logged as new presses but keep the first
    /// press time, so the eventual hold time spans the whole press.
    pub fn key_down(&mut self, key: &str, at_ms: f64) -> bool {
        if !Self::is_recorded(key) {
            return false;
        }

        self.pressed.entry(key.to_string()).or_insert(at_ms);

        let hand = Self::hand_for(key);
        let mut event = KeystrokeEvent::new(key, hand).with_timestamp(at_ms);
        if let Some((prev_hand, prev_at)) = self.last_down {
            event = event.with_latency(Direction::between(prev_hand, hand), at_ms - prev_at);
        }
        self.last_down = Some((hand, at_ms));
        self.events.push(event);
        true
    }

    /// Record a key up at `at_ms`, filling the hold time of the latest open press.
    pub fn key_up(&mut self, key: &str, at_ms: f64) {
        let Some(pressed_at) = self.pressed.remove(key) else {
            return;
        };
        let hold_time = at_ms - pressed_at;

        if let Some(event) = self
            .events
            .iter_mut()
            .rev()
            .find(|e| e.key == key && e.hold_time.is_none())
        {
            event.hold_time = Some(hold_time);
        }
    }

    pub fn events(&self) -> &[KeystrokeEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<KeystrokeEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop all recorded events and pressed-key state.
    pub fn clear(&mut self) {
        self.events.clear();
        self.pressed.clear();
        self.last_down = None;
    }
}
