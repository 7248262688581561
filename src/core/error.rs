//! Error taxonomy for capture sessions and trace waits
//!
//! Only misuse and configuration problems are errors. Operational outcomes
//! (timeout elapsed, avoided pattern seen, required patterns unmet) are
//! reported through [`MatchResult`](crate::core::trace::MatchResult).

use super::transport::{StartupStatus, TransportError};
use thiserror::Error;

/// Result alias used throughout the core
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Capture session error types
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The transport did not report a successful startup
    #[error("Could not start trace capture. status: {status}")]
    StartupFailure {
        /// Status observed once startup completed (or gave up)
        status: StartupStatus,
    },

    /// Transport teardown reported an error
    #[error("Could not stop trace capture: {0}")]
    ShutdownFailure(String),

    /// The hardware mutex was not obtained in time
    #[error("Hardware mutex not acquired within {timeout_ms} ms")]
    MutexAcquisitionTimeout {
        /// Caller's budget
        timeout_ms: u64,
    },

    /// Duplicate event or duplicate pattern in an event map
    #[error("Invalid event map: {0}")]
    InvalidEventMap(String),

    /// Event has no registered pattern
    #[error("No trace pattern defined for event [{0}]")]
    UnknownEvent(String),

    /// Contradictory or empty wait parameters
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// Operation not allowed in the current session state
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Transport-level failure outside the capture loop
    #[error(transparent)]
    Transport(#[from] TransportError),
}
