//! Core module containing the capture and matching machinery
//!
//! This module provides:
//! - Transport contract plus serial and loopback transports
//! - Hardware mutex with deferred release
//! - Capture sessions and their background loop
//! - Trace waits over captured output
//! - Event map for symbolic waits

mod capture;
pub mod error;
pub mod event_map;
pub mod hardware;
pub mod session;
pub mod trace;
pub mod transport;
