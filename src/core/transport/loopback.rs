//! In-memory loopback transport
//!
//! Stands in for a device: lines emitted through a [`LoopbackHandle`] are
//! delivered to the session as if the device printed them, and commands the
//! session writes are recorded on the handle. Scripted responses let a test
//! model simple command/response firmware.

use super::{StartupSignal, StartupStatus, Transport, TransportError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the loopback transport behaves on `begin_capture`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupBehavior {
    /// Signal success
    #[default]
    Succeed,
    /// Signal an error and return normally
    SignalError,
    /// Return an error without signalling
    FailWithoutSignal,
}

#[derive(Debug, Default)]
struct Behavior {
    startup: StartupBehavior,
    startup_delay: Duration,
    fail_teardown: bool,
    link_management: bool,
    responses: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
struct Shared {
    incoming_tx: Sender<String>,
    incoming_rx: Receiver<String>,
    written: Mutex<Vec<String>>,
    link_commands: Mutex<Vec<String>>,
    behavior: Mutex<Behavior>,
    begin_calls: AtomicUsize,
    end_calls: AtomicUsize,
}

/// Control side of a [`LoopbackTransport`]
#[derive(Debug, Clone)]
pub struct LoopbackHandle {
    shared: Arc<Shared>,
}

impl LoopbackHandle {
    /// Emit one line as device output
    pub fn emit(&self, line: impl Into<String>) {
        // Our own receiver lives in `shared`, so the channel never disconnects.
        let _ = self.shared.incoming_tx.send(line.into());
    }

    /// Emit several lines in order
    pub fn emit_all<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            self.emit(line);
        }
    }

    /// Reply with `lines` whenever `command` is written to the device
    pub fn respond_to<I, S>(&self, command: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared
            .behavior
            .lock()
            .responses
            .insert(command.to_string(), lines.into_iter().map(Into::into).collect());
    }

    /// Select startup behavior for the next `begin_capture`
    pub fn set_startup(&self, startup: StartupBehavior) {
        self.shared.behavior.lock().startup = startup;
    }

    /// Delay startup completion by `delay`
    pub fn set_startup_delay(&self, delay: Duration) {
        self.shared.behavior.lock().startup_delay = delay;
    }

    /// Make `end_capture` report an error
    pub fn set_fail_teardown(&self, fail: bool) {
        self.shared.behavior.lock().fail_teardown = fail;
    }

    /// Accept link-management commands
    pub fn set_link_management(&self, enabled: bool) {
        self.shared.behavior.lock().link_management = enabled;
    }

    /// Commands written by the session so far
    pub fn written(&self) -> Vec<String> {
        self.shared.written.lock().clone()
    }

    /// Link-management commands received so far
    pub fn link_commands(&self) -> Vec<String> {
        self.shared.link_commands.lock().clone()
    }

    /// Number of `begin_capture` calls
    pub fn begin_calls(&self) -> usize {
        self.shared.begin_calls.load(Ordering::SeqCst)
    }

    /// Number of `end_capture` calls
    pub fn end_calls(&self) -> usize {
        self.shared.end_calls.load(Ordering::SeqCst)
    }
}

/// Loopback transport
#[derive(Debug)]
pub struct LoopbackTransport {
    shared: Arc<Shared>,
    pending: Option<String>,
    open: bool,
}

impl LoopbackTransport {
    /// Create a transport and its control handle
    pub fn new() -> (Self, LoopbackHandle) {
        let (incoming_tx, incoming_rx) = unbounded();
        let shared = Arc::new(Shared {
            incoming_tx,
            incoming_rx,
            written: Mutex::new(Vec::new()),
            link_commands: Mutex::new(Vec::new()),
            behavior: Mutex::new(Behavior::default()),
            begin_calls: AtomicUsize::new(0),
            end_calls: AtomicUsize::new(0),
        });

        let handle = LoopbackHandle {
            shared: shared.clone(),
        };

        (
            Self {
                shared,
                pending: None,
                open: false,
            },
            handle,
        )
    }
}

impl Transport for LoopbackTransport {
    fn begin_capture(&mut self, startup: StartupSignal) -> Result<(), TransportError> {
        self.shared.begin_calls.fetch_add(1, Ordering::SeqCst);

        let (behavior, delay) = {
            let behavior = self.shared.behavior.lock();
            (behavior.startup, behavior.startup_delay)
        };

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        match behavior {
            StartupBehavior::Succeed => {
                self.open = true;
                startup.complete(StartupStatus::Success);
                Ok(())
            }
            StartupBehavior::SignalError => {
                startup.complete(StartupStatus::Error);
                Ok(())
            }
            StartupBehavior::FailWithoutSignal => {
                Err(TransportError::ConnectionFailed("loopback startup refused".to_string()))
            }
        }
    }

    fn poll_readable(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if self.pending.is_some() {
            return Ok(true);
        }

        match self.shared.incoming_rx.recv_timeout(timeout) {
            Ok(line) => {
                self.pending = Some(line);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        if let Some(line) = self.pending.take() {
            return Ok(line);
        }

        self.shared
            .incoming_rx
            .try_recv()
            .map_err(|e| TransportError::ReceiveError(e.to_string()))
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }

        self.shared.written.lock().push(line.to_string());

        let replies = self.shared.behavior.lock().responses.get(line).cloned();
        if let Some(replies) = replies {
            for reply in replies {
                let _ = self.shared.incoming_tx.send(reply);
            }
        }

        Ok(())
    }

    fn end_capture(&mut self) -> Result<(), TransportError> {
        self.shared.end_calls.fetch_add(1, Ordering::SeqCst);
        self.open = false;
        self.pending = None;

        if self.shared.behavior.lock().fail_teardown {
            return Err(TransportError::ShutdownError("loopback teardown refused".to_string()));
        }

        Ok(())
    }

    fn send_link_command(&mut self, command: &str) -> bool {
        if !self.shared.behavior.lock().link_management {
            return false;
        }

        self.shared.link_commands.lock().push(command.to_string());
        true
    }

    fn describe(&self) -> String {
        "Loopback".to_string()
    }
}
