//! Typed errors for each failure domain.

use std::path::PathBuf;
use std::time::Duration;

/// A member's metrics could not be gathered this cycle.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("collection for {member} timed out after {after:?}")]
    Timeout { member: String, after: Duration },
    #[error("member {member} unreachable: {reason}")]
    Unreachable { member: String, reason: String },
    #[error("collector command failed: {0}")]
    Command(String),
    #[error("malformed collector output: {0}")]
    Parse(String),
    #[error("invalid sample: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GpsError {
    #[error("GPS collection is disabled")]
    Disabled,
    #[error("no GPS sources available")]
    NoSourcesAvailable,
    #[error("failed to collect GPS data from any source: {}", .0.join("; "))]
    AllSourcesFailed(Vec<String>),
    #[error("{origin} source: {message}")]
    Source { origin: String, message: String },
    #[error("{origin} source timed out after {after:?}")]
    Timeout { origin: String, after: Duration },
    #[error("invalid fix: {0}")]
    InvalidFix(String),
    #[error("fix at {current} is not after previous fix at {previous}")]
    OutOfOrder { previous: String, current: String },
}

/// The routing control plane rejected or failed a change.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("failed to apply metric {metric} to {member}: {reason}")]
    ApplyMetric {
        member: String,
        metric: u32,
        reason: String,
    },
    #[error("failed to switch from {from} to {to}: {reason}")]
    Switch {
        from: String,
        to: String,
        reason: String,
    },
    #[error("failed to query active member: {0}")]
    Query(String),
    #[error("controller {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("unknown member: {0}")]
    UnknownMember(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification rate limit reached")]
    RateLimited,
    #[error("no outbound connectivity")]
    Offline,
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}
