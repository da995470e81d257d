//! Keystroke input for the typing classifier.
//!
//! This module provides the event types accepted from clients and a
//! recorder that turns raw key down/up timings into those events.

pub mod recorder;
pub mod types;

// Re-export commonly used types
pub use recorder::KeystrokeRecorder;
pub use types::{
    deserialize_log, events_from_values, parse_log, Direction, Gender, Hand, InputError,
    KeystrokeEvent,
};
