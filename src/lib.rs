//! # Tracewait Core Library
//!
//! Capture trace output from a device under test and wait for it to show
//! (or not show) particular lines:
//! - Background capture into a line queue
//! - Regex waits with required and avoided patterns
//! - Symbolic events bound to patterns
//! - Exclusive hardware access with a recovery delay
//!
//! ## Example
//!
//! ```rust,no_run
//! use tracewait_core::{CaptureSession, CaptureSettings, SerialConfig, SerialTransport, TraceQuery};
//!
//! fn main() -> anyhow::Result<()> {
//!     let transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 115200));
//!     let session = CaptureSession::new(transport, CaptureSettings::default());
//!     session.start_capture()?;
//!
//!     session.send_command("reboot");
//!     let result = session.wait_for_trace(
//!         &TraceQuery::new().require("Booting").avoid("panic").timeout_ms(5000),
//!     )?;
//!     println!("booted: {}", result.success);
//!
//!     session.stop_capture()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{AppConfig, EventBinding};
pub use crate::core::error::{CaptureError, Result};
pub use crate::core::event_map::{EventMap, EventQuery};
pub use crate::core::hardware::{HardwareMutex, ReleaseScheduler};
pub use crate::core::session::{CaptureSession, CaptureSettings, CaptureState};
pub use crate::core::trace::{
    Collected, CollectionPolicy, MatchResult, ResponseFormat, TraceQuery, TraceRecord, TraceWaiter,
    WaitOptions,
};
pub use crate::core::transport::{
    LoopbackHandle, LoopbackTransport, SerialConfig, SerialFlowControl, SerialParity, SerialTransport,
    StartupBehavior, StartupSignal, StartupStatus, Transport, TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
