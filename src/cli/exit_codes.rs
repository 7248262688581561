//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::error::CaptureError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Timed out waiting for exclusive hardware access
    pub const TIMEOUT: u8 = 4;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Pattern match failed
    pub const PATTERN_NOT_FOUND: u8 = 16;

    /// Capture could not be started
    pub const STARTUP_FAILED: u8 = 18;

    /// Capture teardown failed
    pub const SHUTDOWN_FAILED: u8 = 19;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;

    /// Every defined code, ascending
    pub const ALL: [u8; 12] = [0, 1, 2, 3, 4, 7, 8, 14, 16, 18, 19, 127];
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Wait finished without a match
    pub fn pattern_not_found(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::PATTERN_NOT_FOUND, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to `ExitCode`
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::ConnectionRefused => ExitCodes::CONNECTION_FAILED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
        TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
        TransportError::ConfigError(_) => ExitCodes::CONFIG_ERROR,
        TransportError::ConnectionFailed(_) | TransportError::NotConnected | TransportError::Disconnected => {
            ExitCodes::CONNECTION_FAILED
        }
        _ => ExitCodes::ERROR,
    }
}

impl From<TransportError> for CliResult {
    fn from(err: TransportError) -> Self {
        Self::Error(transport_code(&err), err.to_string())
    }
}

impl From<CaptureError> for CliResult {
    fn from(err: CaptureError) -> Self {
        let code = match &err {
            CaptureError::StartupFailure { .. } => ExitCodes::STARTUP_FAILED,
            CaptureError::ShutdownFailure(_) => ExitCodes::SHUTDOWN_FAILED,
            CaptureError::MutexAcquisitionTimeout { .. } => ExitCodes::TIMEOUT,
            CaptureError::InvalidEventMap(_) => ExitCodes::CONFIG_ERROR,
            CaptureError::UnknownEvent(_) | CaptureError::MalformedQuery(_) => ExitCodes::INVALID_ARGS,
            CaptureError::InvalidState(_) => ExitCodes::INTERNAL_ERROR,
            CaptureError::Transport(inner) => transport_code(inner),
        };

        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Hardware mutex timeout",
        7 => "Permission denied",
        8 => "Configuration error",
        14 => "Port not found",
        16 => "Pattern not found",
        18 => "Capture startup failed",
        19 => "Capture shutdown failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in ExitCodes::ALL {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
