//! Transport layer consumed by capture sessions
//!
//! A transport is the device driver side of a session: it opens the
//! physical/logical channel, reports readiness, moves single lines in and
//! out, and tears the channel down. Supplied implementations:
//! - Serial ports (UART over `serialport`)
//! - In-memory loopback (scripted devices for tests and dry runs)

mod loopback;
mod serial;

pub use loopback::{LoopbackHandle, LoopbackTransport, StartupBehavior};
pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialParity, SerialTransport};

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a transport's startup attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartupStatus {
    /// Startup has not reported yet
    #[default]
    Unknown,
    /// Channel is up, reads and writes may begin
    Success,
    /// Channel could not be established
    Error,
}

impl fmt::Display for StartupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Success => write!(f, "Success"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// One-shot "startup complete" signal handed to [`Transport::begin_capture`]
///
/// Completing consumes the signal, so it can be raised at most once. A
/// signal dropped without completing reads as [`StartupStatus::Error`] on
/// the waiting side.
#[derive(Debug)]
pub struct StartupSignal {
    tx: Sender<StartupStatus>,
}

impl StartupSignal {
    /// Create a signal and the receiver that observes it
    pub fn new() -> (Self, Receiver<StartupStatus>) {
        let (tx, rx) = bounded(1);
        (Self { tx }, rx)
    }

    /// Report the startup outcome
    pub fn complete(self, status: StartupStatus) {
        // The receiver may have given up waiting already.
        let _ = self.tx.send(status);
    }

    /// Report a successful startup
    pub fn success(self) {
        self.complete(StartupStatus::Success);
    }

    /// Report a failed startup
    pub fn error(self) {
        self.complete(StartupStatus::Error);
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Disconnected
    #[error("Disconnected")]
    Disconnected,

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),

    /// Teardown error
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

/// Capability a device driver exposes to a capture session
///
/// The session calls `begin_capture` once per start on its capture thread,
/// then alternates `poll_readable`/`read_line`/`write_line` until stopped,
/// then calls `end_capture`.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    /// Establish the channel and complete `startup` exactly once.
    ///
    /// Must not block indefinitely when the channel cannot be opened.
    fn begin_capture(&mut self, startup: StartupSignal) -> Result<(), TransportError>;

    /// Wait up to `timeout` for a line to become readable
    fn poll_readable(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// Read one line; only called after `poll_readable` returned true
    fn read_line(&mut self) -> Result<String, TransportError>;

    /// Forward one outbound command
    fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Shut the channel down, gracefully first and forcefully after a grace
    /// period. Must be idempotent when capture never fully started.
    fn end_capture(&mut self) -> Result<(), TransportError>;

    /// Send a command to the link-management tooling below the device.
    ///
    /// Returns false when unsupported or unavailable.
    fn send_link_command(&mut self, _command: &str) -> bool {
        false
    }

    /// Human readable description for logs
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_delivers_once() {
        let (signal, rx) = StartupSignal::new();
        signal.success();
        assert_eq!(rx.recv().ok(), Some(StartupStatus::Success));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_dropped_signal_disconnects() {
        let (signal, rx) = StartupSignal::new();
        drop(signal);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StartupStatus::Unknown.to_string(), "Unknown");
        assert_eq!(StartupStatus::default(), StartupStatus::Unknown);
    }
}
