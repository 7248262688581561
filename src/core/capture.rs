//! Background capture loop
//!
//! One loop runs per capturing session on its own thread. It owns the
//! transport's startup and teardown, moves lines from the transport into
//! the read queue, and drains at most one queued command per iteration.

use super::hardware::HardwareMutex;
use super::session::CaptureState;
use super::transport::{StartupSignal, StartupStatus, Transport, TransportError};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// State shared between a session and its capture thread
pub(crate) struct CaptureShared {
    pub id: Uuid,
    pub transport: Mutex<Box<dyn Transport>>,
    pub hardware: HardwareMutex,
    pub state: RwLock<CaptureState>,
    pub startup_status: RwLock<StartupStatus>,
    pub stop_requested: AtomicBool,
    pub read_tx: Sender<String>,
    pub write_rx: Receiver<String>,
    pub poll_interval: Duration,
}

/// Outcome of transport teardown, reported once the loop has exited
pub(crate) type ShutdownReport = Result<(), TransportError>;

/// Capture thread body
pub(crate) fn run(shared: &CaptureShared, startup: StartupSignal, shutdown: &Sender<ShutdownReport>) {
    let status = begin(shared);

    // Publish state before the starter sees the status. Both happen under the
    // state lock so a starter that already gave up cannot be overwritten.
    let abandoned = {
        let mut state = shared.state.write();
        let abandoned = shared.stop_requested.load(Ordering::SeqCst);
        if !abandoned {
            *shared.startup_status.write() = status;
            *state = if status == StartupStatus::Success {
                CaptureState::Capturing
            } else {
                CaptureState::Error
            };
        }
        abandoned
    };

    if abandoned || status != StartupStatus::Success {
        if abandoned {
            tracing::warn!(session = %shared.id, "Startup finished after the starter gave up ({})", status);
        }
        let teardown = shared.transport.lock().end_capture();
        if let Err(e) = &teardown {
            tracing::warn!(session = %shared.id, "Teardown after failed startup: {}", e);
        }
        startup.complete(status);
        let _ = shutdown.send(teardown);
        return;
    }

    startup.complete(status);
    tracing::info!(session = %shared.id, "Capture loop running");

    let mut failure = None;
    while !shared.stop_requested.load(Ordering::SeqCst) {
        if let Err(e) = step(shared) {
            tracing::error!(session = %shared.id, "Capture loop encountered an error: {}", e);
            failure = Some(e);
            break;
        }
    }

    tracing::debug!(session = %shared.id, "Capture loop stopping");
    let teardown = shared.transport.lock().end_capture();

    if failure.is_some() {
        *shared.state.write() = CaptureState::Error;
    }

    let _ = shutdown.send(teardown);
}

/// Run the transport's startup and reduce it to a single status.
///
/// A startup error is logged and swallowed; the signalled status decides.
fn begin(shared: &CaptureShared) -> StartupStatus {
    let (signal, signalled) = StartupSignal::new();
    let result = shared.transport.lock().begin_capture(signal);

    let status = signalled.try_recv();
    match (result, status) {
        (Ok(()), Ok(status)) => status,
        (Ok(()), Err(_)) => {
            tracing::warn!(session = %shared.id, "Transport returned without signalling startup");
            StartupStatus::Error
        }
        (Err(e), status) => {
            tracing::error!(session = %shared.id, "Log startup threw exception: {}", e);
            status.unwrap_or(StartupStatus::Error)
        }
    }
}

/// One capture iteration: poll, move at most one line in and one command out
fn step(shared: &CaptureShared) -> Result<(), TransportError> {
    // Someone else is using the hardware; look again next iteration.
    if !shared.hardware.try_acquire_idle_for(shared.poll_interval) {
        return Ok(());
    }

    let result = exchange(shared);
    shared.hardware.release_now();
    result
}

fn exchange(shared: &CaptureShared) -> Result<(), TransportError> {
    let mut transport = shared.transport.lock();

    if transport.poll_readable(shared.poll_interval)? {
        let line = transport.read_line()?;
        let line = line.trim();
        if !line.is_empty() {
            tracing::trace!(session = %shared.id, "<-- {}", line);
            // The session keeps the receiving side alive.
            let _ = shared.read_tx.send(line.to_string());
        }
    }

    match shared.write_rx.try_recv() {
        Ok(command) => {
            tracing::trace!(session = %shared.id, "--> {}", command);
            transport.write_line(&command)?;
        }
        Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
    }

    Ok(())
}

/// Spawned capture thread plus its shutdown report channel
pub(crate) struct CaptureWorker {
    pub handle: std::thread::JoinHandle<()>,
    pub shutdown: Receiver<ShutdownReport>,
}

/// Start the capture thread for `shared`
pub(crate) fn spawn(shared: Arc<CaptureShared>, startup: StartupSignal) -> std::io::Result<CaptureWorker> {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    let name = format!("capture-{}", shared.id.simple());

    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || run(&shared, startup, &shutdown_tx))?;

    Ok(CaptureWorker {
        handle,
        shutdown: shutdown_rx,
    })
}
