// Errors - one enum per failure category, each with its own recovery:
// capture errors skip a tick, connect errors leave the session idle,
// transmit errors tear it down, config errors are rejected before any network IO

use thiserror::Error;

use crate::types::SessionState;

/// Display capture failed for one tick.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no primary display found")]
    NoPrimaryDisplay,
    #[error("capture backend unavailable: {0}")]
    Backend(String),
    #[error("captured frame is empty")]
    EmptyFrame,
    #[error("capture did not finish within {0:?}")]
    TimedOut(std::time::Duration),
}

/// Handshake with the device failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not resolve {address}: {reason}")]
    Resolve { address: String, reason: String },
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{step} failed: {reason}")]
    Handshake { step: &'static str, reason: String },
}

/// A write or drift-check round trip failed after the session was established.
#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("could not encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("brightness check failed: {0}")]
    DriftCheck(String),
    #[error("session is closed")]
    Closed,
}

/// Invalid configuration handed to `start()`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device address is empty")]
    EmptyAddress,
    #[error("invalid device address '{0}'")]
    InvalidAddress(String),
    #[error("brightness {0} is outside 1-100")]
    Brightness(u8),
    #[error("interval {got} ms is below the minimum of {min} ms")]
    IntervalTooShort { got: u64, min: u64 },
    #[error("interval {got} ms is above the maximum of {max} ms")]
    IntervalTooLong { got: u64, max: u64 },
    #[error("transition {got} ms is above the maximum of {max} ms")]
    Transition { got: u64, max: u64 },
}

/// Reasons a start request is refused without touching the network.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session is busy ({0})")]
    Busy(SessionState),
    #[error("could not start session worker: {0}")]
    Worker(#[from] std::io::Error),
}
