//! Process-wide usage counters.
//!
//! Counts requests and rendering outcomes only; no keystroke logs, feature
//! values or images are retained.

pub mod log;

pub use log::{create_shared_log, create_shared_log_with_persistence, SharedUsageLog, UsageLog, UsageStats};
