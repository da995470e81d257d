//! Keystroke event types as they arrive from a typing session.
//!
//! Records come from browsers and scripts of varying quality, so every
//! timing field is optional and deserialization never fails on a single bad
//! value: numeric strings are coerced, anything unparseable becomes `None`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Hand that pressed a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hand {
    L,
    R,
}

impl Hand {
    pub const ALL: [Hand; 2] = [Hand::L, Hand::R];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hand::L => "L",
            Hand::R => "R",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "L" => Some(Hand::L),
            "R" => Some(Hand::R),
            _ => None,
        }
    }
}

/// Hand-to-hand transition between two consecutive key presses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    LL,
    LR,
    RL,
    RR,
}

impl Direction {
    pub const ALL: [Direction; 4] = [Direction::LL, Direction::LR, Direction::RL, Direction::RR];

    /// Transition from the hand of the previous key to the hand of the current one.
    pub fn between(from: Hand, to: Hand) -> Self {
        match (from, to) {
            (Hand::L, Hand::L) => Direction::LL,
            (Hand::L, Hand::R) => Direction::LR,
            (Hand::R, Hand::L) => Direction::RL,
            (Hand::R, Hand::R) => Direction::RR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::LL => "LL",
            Direction::LR => "LR",
            Direction::RL => "RL",
            Direction::RR => "RR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "LL" => Some(Direction::LL),
            "LR" => Some(Direction::LR),
            "RL" => Some(Direction::RL),
            "RR" => Some(Direction::RR),
            _ => None,
        }
    }
}

/// Self-reported gender of the typist, used as a categorical model input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
        }
    }
}

impl FromStr for Gender {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Male" => Ok(Gender::Male),
            "Female" => Ok(Gender::Female),
            other => Err(InputError::UnknownGender(other.to_string())),
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed key press.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystrokeEvent {
    /// Key identifier as reported by the client
    #[serde(default, deserialize_with = "lenient_string")]
    pub key: String,
    /// Hand that pressed the key
    #[serde(default, deserialize_with = "lenient_hand")]
    pub hand: Option<Hand>,
    /// Client timestamp in milliseconds
    #[serde(default, deserialize_with = "lenient_f64")]
    pub timestamp: Option<f64>,
    /// How long the key stayed down, in milliseconds
    #[serde(default, deserialize_with = "lenient_f64")]
    pub hold_time: Option<f64>,
    /// Time since the previous key press, in milliseconds
    #[serde(default, deserialize_with = "lenient_f64")]
    pub latency: Option<f64>,
    /// Hand transition from the previous key press
    #[serde(default, deserialize_with = "lenient_direction")]
    pub direction: Option<Direction>,
}

impl KeystrokeEvent {
    pub fn new(key: impl Into<String>, hand: Hand) -> Self {
        Self {
            key: key.into(),
            hand: Some(hand),
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_hold_time(mut self, hold_time: f64) -> Self {
        self.hold_time = Some(hold_time);
        self
    }

    pub fn with_latency(mut self, direction: Direction, latency: f64) -> Self {
        self.direction = Some(direction);
        self.latency = Some(latency);
        self
    }

    /// Hold time if this event can take part in hold-time aggregation.
    pub fn valid_hold(&self) -> Option<(Hand, f64)> {
        Some((self.hand?, self.hold_time?))
    }

    /// Latency if this event can take part in latency aggregation.
    pub fn valid_latency(&self) -> Option<(Direction, f64)> {
        let latency = self.latency.filter(|l| *l > 0.0)?;
        Some((self.direction?, latency))
    }
}

/// Errors for inputs that cannot be interpreted even after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum InputError {
    UnknownGender(String),
    MalformedLog(String),
    EmptyLog,
    /// Voice measurements missing a field or holding a non-number
    MalformedMeasurements(String),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::UnknownGender(g) => {
                write!(f, "Unknown gender '{g}' (expected 'Male' or 'Female')")
            }
            InputError::MalformedLog(e) => write!(f, "Malformed keystroke log: {e}"),
            InputError::EmptyLog => write!(f, "Empty keystroke log"),
            InputError::MalformedMeasurements(e) => write!(f, "Malformed voice measurements: {e}"),
        }
    }
}

impl std::error::Error for InputError {}

/// Parse a JSON array of keystroke records.
///
/// Only a document that is not an array fails. Entries that are not
/// records are dropped with a warning.
pub fn parse_log(json: &str) -> Result<Vec<KeystrokeEvent>, InputError> {
    let values: Vec<Value> =
        serde_json::from_str(json).map_err(|e| InputError::MalformedLog(e.to_string()))?;
    Ok(events_from_values(values))
}

/// Convert raw log entries, skipping the ones that are not records.
pub fn events_from_values(values: Vec<Value>) -> Vec<KeystrokeEvent> {
    let total = values.len();
    let events: Vec<KeystrokeEvent> = values
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| {
            if !value.is_object() {
                tracing::warn!(index, entry = %value, "skipping keystroke entry that is not a record");
                return None;
            }
            match serde_json::from_value(value) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping malformed keystroke record");
                    None
                }
            }
        })
        .collect();
    if events.len() < total {
        tracing::debug!(kept = events.len(), total, "keystroke log had malformed entries");
    }
    events
}

/// Serde adapter for request bodies carrying a keystroke log.
pub fn deserialize_log<'de, D>(deserializer: D) -> Result<Vec<KeystrokeEvent>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<Value>::deserialize(deserializer).map(events_from_values)
}

/// Coerce a JSON value to a finite number; strings are parsed, everything else is missing.
pub(crate) fn coerce_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(coerce_f64))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    })
}

fn lenient_hand<'de, D>(deserializer: D) -> Result<Option<Hand>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(Value::as_str).and_then(Hand::parse))
}

fn lenient_direction<'de, D>(deserializer: D) -> Result<Option<Direction>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_str)
        .and_then(Direction::parse))
}
