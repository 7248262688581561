//! Capture session management
//!
//! A [`CaptureSession`] owns one transport for its lifetime. While
//! capturing, a background thread moves device output into the read queue;
//! callers push commands onto the write queue and wait for traces from
//! their own thread.

use super::capture::{self, CaptureShared, CaptureWorker};
use super::error::{CaptureError, Result};
use super::event_map::{EventMap, EventQuery};
use super::hardware::HardwareMutex;
use super::trace::{MatchResult, TraceQuery, TraceWaiter};
use super::transport::{StartupSignal, StartupStatus, Transport};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureState {
    /// Not capturing
    Idle,
    /// Transport startup in progress
    Starting,
    /// Capture loop running
    Capturing,
    /// Teardown in progress
    Stopping,
    /// Startup failed or the capture loop died
    Error,
}

impl CaptureState {
    /// Whether `start_capture` may begin from this state
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Starting => write!(f, "Starting"),
            Self::Capturing => write!(f, "Capturing"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Session timing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Settling time after exclusive hardware operations, in seconds.
    /// Zero releases the hardware mutex immediately.
    pub hardware_recovery_time_sec: f64,
    /// Budget for acquiring the hardware mutex in start/stop/link commands
    pub mutex_timeout_ms: u64,
    /// Budget for the transport's startup signal; 0 waits forever
    pub startup_timeout_ms: u64,
    /// Capture loop multiplex wait
    pub poll_interval_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            hardware_recovery_time_sec: 0.0,
            mutex_timeout_ms: 10_000,
            startup_timeout_ms: 30_000,
            poll_interval_ms: 50,
        }
    }
}

impl CaptureSettings {
    /// Set the hardware recovery time
    #[must_use]
    pub fn hardware_recovery_time_sec(mut self, seconds: f64) -> Self {
        self.hardware_recovery_time_sec = seconds;
        self
    }

    /// Set the hardware mutex budget
    #[must_use]
    pub fn mutex_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.mutex_timeout_ms = timeout_ms;
        self
    }

    /// Set the startup budget
    #[must_use]
    pub fn startup_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.startup_timeout_ms = timeout_ms;
        self
    }

    /// Set the capture loop poll interval
    #[must_use]
    pub fn poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Recovery time as a duration; negative or invalid values mean none
    pub fn recovery(&self) -> Duration {
        if self.hardware_recovery_time_sec > 0.0 {
            Duration::try_from_secs_f64(self.hardware_recovery_time_sec).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        }
    }

    fn mutex_timeout(&self) -> Duration {
        Duration::from_millis(self.mutex_timeout_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Device capture session
pub struct CaptureSession {
    shared: Arc<CaptureShared>,
    settings: CaptureSettings,
    read_rx: Receiver<String>,
    write_tx: Sender<String>,
    worker: Mutex<Option<CaptureWorker>>,
    event_map: RwLock<EventMap>,
}

impl CaptureSession {
    /// Create an idle session around `transport`
    pub fn new(transport: impl Transport + 'static, settings: CaptureSettings) -> Self {
        Self::from_boxed(Box::new(transport), settings)
    }

    /// Create an idle session around an already boxed transport
    pub fn from_boxed(transport: Box<dyn Transport>, settings: CaptureSettings) -> Self {
        let (read_tx, read_rx) = unbounded();
        let (write_tx, write_rx) = unbounded();

        let shared = Arc::new(CaptureShared {
            id: Uuid::new_v4(),
            transport: Mutex::new(transport),
            hardware: HardwareMutex::new(settings.recovery()),
            state: RwLock::new(CaptureState::Idle),
            startup_status: RwLock::new(StartupStatus::Unknown),
            stop_requested: AtomicBool::new(false),
            read_tx,
            write_rx,
            poll_interval: settings.poll_interval(),
        });

        Self {
            shared,
            settings,
            read_rx,
            write_tx,
            worker: Mutex::new(None),
            event_map: RwLock::new(EventMap::new()),
        }
    }

    /// Unique session ID
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current state
    pub fn state(&self) -> CaptureState {
        *self.shared.state.read()
    }

    /// Check if capturing
    pub fn is_capturing(&self) -> bool {
        self.state() == CaptureState::Capturing
    }

    /// Status reported by the last startup attempt
    pub fn startup_status(&self) -> StartupStatus {
        *self.shared.startup_status.read()
    }

    /// Timing configuration
    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Transport description
    pub fn describe(&self) -> String {
        self.shared.transport.lock().describe()
    }

    /// Start capturing device output.
    ///
    /// Returns once the transport reported its startup outcome. Already
    /// capturing is not an error.
    pub fn start_capture(&self) -> Result<StartupStatus> {
        let mut worker = self.worker.lock();

        let state = self.state();
        if state == CaptureState::Capturing {
            tracing::info!("Traces are already being captured. ignoring start request");
            return Ok(self.startup_status());
        }
        if !state.can_start() {
            return Err(CaptureError::InvalidState(format!("cannot start while {state}")));
        }

        // Loop died on its own; collect it before starting over.
        if let Some(stale) = worker.take() {
            let _ = stale.handle.join();
        }

        self.shared.hardware.acquire(self.settings.mutex_timeout())?;

        *self.shared.state.write() = CaptureState::Starting;
        *self.shared.startup_status.write() = StartupStatus::Unknown;
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        tracing::info!(session = %self.id(), "Starting trace capture on {}", self.describe());

        let (signal, signalled) = StartupSignal::new();
        let spawned = match capture::spawn(self.shared.clone(), signal) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.shared.hardware.release();
                *self.shared.state.write() = CaptureState::Error;
                *self.shared.startup_status.write() = StartupStatus::Error;
                tracing::error!("Could not spawn capture thread: {}", e);
                return Err(CaptureError::StartupFailure {
                    status: StartupStatus::Error,
                });
            }
        };

        let received = if self.settings.startup_timeout_ms == 0 {
            signalled.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            signalled.recv_timeout(Duration::from_millis(self.settings.startup_timeout_ms))
        };

        self.shared.hardware.release();

        let status = match received {
            Ok(status) => status,
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!("Transport did not report startup within {} ms", self.settings.startup_timeout_ms);
                // Under the state lock, so the loop either sees the stop
                // request before publishing or gets overwritten here.
                let mut state = self.shared.state.write();
                self.shared.stop_requested.store(true, Ordering::SeqCst);
                *self.shared.startup_status.write() = StartupStatus::Unknown;
                *state = CaptureState::Error;
                drop(state);
                *worker = Some(spawned);
                return Err(CaptureError::StartupFailure {
                    status: StartupStatus::Unknown,
                });
            }
            Err(RecvTimeoutError::Disconnected) => StartupStatus::Error,
        };

        if status != StartupStatus::Success {
            let _ = spawned.handle.join();
            *self.shared.state.write() = CaptureState::Error;
            tracing::error!("Could not startup log capturing thread. status: {}", status);
            return Err(CaptureError::StartupFailure { status });
        }

        *worker = Some(spawned);
        tracing::info!(session = %self.id(), "Trace capture started");
        Ok(status)
    }

    /// Stop capturing.
    ///
    /// Blocks until the capture loop has run the transport's teardown. The
    /// session is idle afterwards even when teardown reported an error.
    pub fn stop_capture(&self) -> Result<()> {
        let mut worker = self.worker.lock();

        if self.state() != CaptureState::Capturing {
            tracing::info!("Traces are not being captured. ignoring stop request");
            return Ok(());
        }

        self.shared.hardware.acquire(self.settings.mutex_timeout())?;
        *self.shared.state.write() = CaptureState::Stopping;
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        let report = match worker.take() {
            Some(running) => {
                let report = running.shutdown.recv();
                let joined = running.handle.join();
                match (report, joined) {
                    (Ok(report), Ok(())) => report.map_err(|e| CaptureError::ShutdownFailure(e.to_string())),
                    (_, Err(_)) => Err(CaptureError::ShutdownFailure("capture thread panicked".to_string())),
                    (Err(_), Ok(())) => Err(CaptureError::ShutdownFailure(
                        "capture loop exited without reporting".to_string(),
                    )),
                }
            }
            None => Ok(()),
        };

        self.shared.hardware.release();
        *self.shared.state.write() = CaptureState::Idle;

        match &report {
            Ok(()) => tracing::info!(session = %self.id(), "Trace capture stopped"),
            Err(e) => tracing::error!(session = %self.id(), "Stop capturing traces exception: {}", e),
        }

        report
    }

    /// Take the hardware mutex, failing after `timeout_ms`
    pub fn acquire_hardware_mutex(&self, timeout_ms: u64) -> Result<()> {
        self.shared.hardware.acquire(Duration::from_millis(timeout_ms))
    }

    /// Give the hardware mutex back, after the recovery time if one is set
    pub fn release_hardware_mutex(&self) {
        self.shared.hardware.release();
    }

    /// Whether the hardware mutex is held or its release is still pending
    pub fn hardware_busy(&self) -> bool {
        self.shared.hardware.is_locked()
    }

    /// Queue a command for the device
    pub fn send_command(&self, command: impl Into<String>) {
        // The write queue's receiver lives in `shared`.
        let _ = self.write_tx.send(command.into());
    }

    /// Send a command to the link-management tooling under exclusive access
    pub fn send_link_command(&self, command: &str) -> Result<bool> {
        self.shared.hardware.acquire(self.settings.mutex_timeout())?;
        let sent = self.shared.transport.lock().send_link_command(command);
        self.shared.hardware.release();

        if sent {
            tracing::debug!("sent link command: {}", command);
        } else {
            tracing::warn!("Link management commands not supported by {}", self.describe());
        }
        Ok(sent)
    }

    /// Discard all queued traces, returning how many were dropped
    pub fn dump_traces(&self) -> usize {
        self.read_rx.try_iter().count()
    }

    /// Number of traces waiting to be consumed
    pub fn backlog(&self) -> usize {
        self.read_rx.len()
    }

    /// Take the next captured trace, waiting up to `timeout`
    pub fn next_trace(&self, timeout: Duration) -> Option<String> {
        self.read_rx.recv_timeout(timeout).ok()
    }

    /// Waiter over this session's read queue
    pub fn waiter(&self) -> TraceWaiter {
        TraceWaiter::new(self.read_rx.clone())
    }

    /// Wait for traces matching `query`
    pub fn wait_for_trace(&self, query: &TraceQuery) -> Result<MatchResult> {
        self.waiter().wait(query)
    }

    /// Replace the event map
    pub fn set_event_map<I, E, P>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (E, P)>,
        E: Into<String>,
        P: Into<String>,
    {
        let map = EventMap::from_pairs(pairs)?;
        *self.event_map.write() = map;
        Ok(())
    }

    /// Copy of the current event map
    pub fn event_map(&self) -> EventMap {
        self.event_map.read().clone()
    }

    /// Patterns bound to `events`
    pub fn patterns_for_events<S: AsRef<str>>(&self, events: &[S]) -> Result<Vec<String>> {
        self.event_map.read().patterns_for_events(events)
    }

    /// Wait for events through the event map
    pub fn wait_for_event(&self, query: &EventQuery) -> Result<MatchResult> {
        let map = self.event_map();
        let trace_query = query.to_trace_query(&map)?;
        let result = self.wait_for_trace(&trace_query)?;
        Ok(map.resolve(result))
    }

    /// [`wait_for_trace`](Self::wait_for_trace) on tokio's blocking pool
    pub async fn wait_for_trace_async(&self, query: TraceQuery) -> Result<MatchResult> {
        let waiter = self.waiter();
        tokio::task::spawn_blocking(move || waiter.wait(&query))
            .await
            .map_err(|e| CaptureError::InvalidState(format!("wait task failed: {e}")))?
    }

    /// [`wait_for_event`](Self::wait_for_event) on tokio's blocking pool
    pub async fn wait_for_event_async(&self, query: EventQuery) -> Result<MatchResult> {
        let map = self.event_map();
        let trace_query = query.to_trace_query(&map)?;
        let result = self.wait_for_trace_async(trace_query).await?;
        Ok(map.resolve(result))
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.is_capturing() {
            if let Err(e) = self.stop_capture() {
                tracing::warn!(session = %self.id(), "Capture did not stop cleanly on drop: {}", e);
            }
        }
    }
}
