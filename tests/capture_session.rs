//! End-to-end capture tests over the loopback transport

use std::time::{Duration, Instant};
use tracewait_core::{
    CaptureError, CaptureSession, CaptureSettings, CaptureState, CollectionPolicy, EventQuery, LoopbackHandle,
    LoopbackTransport, ResponseFormat, StartupBehavior, StartupStatus, TraceQuery,
};

fn fast_settings() -> CaptureSettings {
    CaptureSettings::default()
        .poll_interval_ms(5)
        .mutex_timeout_ms(1000)
        .startup_timeout_ms(2000)
}

fn capturing() -> (CaptureSession, LoopbackHandle) {
    let (transport, handle) = LoopbackTransport::new();
    let session = CaptureSession::new(transport, fast_settings());
    assert_eq!(session.start_capture().unwrap(), StartupStatus::Success);
    (session, handle)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_single_required_line() {
    let (session, handle) = capturing();
    handle.emit("device READY");

    let result = session
        .wait_for_trace(&TraceQuery::new().require("READY").timeout_ms(5000))
        .unwrap();

    assert!(result.success);
    assert_eq!(result.collected.as_raw(), Some("device READY"));
    assert!(result.remaining_required.is_empty());
    session.stop_capture().unwrap();
}

#[test]
fn test_all_required_in_sequence() {
    let (session, handle) = capturing();
    handle.emit_all(["A", "noise", "B"]);

    let result = session
        .wait_for_trace(
            &TraceQuery::new()
                .require_all(["A", "B"])
                .collect(CollectionPolicy::All)
                .timeout_ms(5000),
        )
        .unwrap();

    assert!(result.success);
    assert_eq!(result.collected.lines(), vec!["A", "noise", "B"]);
    assert!(result.remaining_required.is_empty());
    session.stop_capture().unwrap();
}

#[test]
fn test_avoided_line_fails_wait() {
    let (session, handle) = capturing();
    handle.emit_all(["ERROR: fault", "OK"]);

    let result = session
        .wait_for_trace(&TraceQuery::new().require("OK").avoid("ERROR").timeout_ms(5000))
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.remaining_required, vec!["OK"]);
    // The OK line was not consumed.
    assert!(wait_until(|| session.backlog() == 1));
    session.stop_capture().unwrap();
}

#[test]
fn test_timeout_without_input() {
    let (session, _handle) = capturing();

    let start = Instant::now();
    let result = session
        .wait_for_trace(&TraceQuery::new().require("NEVER").timeout_ms(100))
        .unwrap();
    let elapsed = start.elapsed();

    assert!(!result.success);
    assert_eq!(result.remaining_required, vec!["NEVER"]);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150), "took {elapsed:?}");
    session.stop_capture().unwrap();
}

#[test]
fn test_stale_backlog_is_purged() {
    let (session, handle) = capturing();
    handle.emit("OLD");
    assert!(wait_until(|| session.backlog() == 1));

    let result = session
        .wait_for_trace(&TraceQuery::new().require("OLD").use_backlog(false).timeout_ms(100))
        .unwrap();

    assert!(!result.success);
    session.stop_capture().unwrap();
}

#[test]
fn test_command_response_round_trip() {
    let (session, handle) = capturing();
    handle.respond_to("version", ["fw 2.4.1 (build 77)"]);

    session.send_command("version");
    let result = session
        .wait_for_trace(
            &TraceQuery::new()
                .require(r"fw (?P<major>\d+)\.(?P<minor>\d+)")
                .format(ResponseFormat::Processed)
                .timeout_ms(2000),
        )
        .unwrap();

    assert!(result.success);
    let record = &result.collected.records().unwrap()[0];
    assert_eq!(record.field("major"), Some("2"));
    assert_eq!(record.field("minor"), Some("4"));
    assert_eq!(handle.written(), vec!["version"]);
    session.stop_capture().unwrap();
}

#[test]
fn test_commands_sent_in_order() {
    let (session, handle) = capturing();
    for command in ["one", "two", "three"] {
        session.send_command(command);
    }

    assert!(wait_until(|| handle.written().len() == 3));
    assert_eq!(handle.written(), vec!["one", "two", "three"]);
    session.stop_capture().unwrap();
}

#[test]
fn test_dump_traces() {
    let (session, handle) = capturing();
    handle.emit_all(["a", "b", "c"]);
    assert!(wait_until(|| session.backlog() == 3));

    assert_eq!(session.dump_traces(), 3);
    assert_eq!(session.backlog(), 0);
    session.stop_capture().unwrap();
}

#[test]
fn test_event_wait() {
    let (session, handle) = capturing();
    session
        .set_event_map([("boot", r"Booting v\d+"), ("ready", "READY"), ("fault", "HardFault")])
        .unwrap();
    handle.emit_all(["Booting v3", "READY"]);

    let result = session
        .wait_for_event(
            &EventQuery::new()
                .require_all(["boot", "ready"])
                .avoid("fault")
                .collect(CollectionPolicy::Matching)
                .format(ResponseFormat::Processed)
                .timeout_ms(2000),
        )
        .unwrap();

    assert!(result.success);
    let events: Vec<_> = result
        .collected
        .records()
        .unwrap()
        .iter()
        .map(|r| r.event.as_deref())
        .collect();
    assert_eq!(events, vec![Some("boot"), Some("ready")]);
    session.stop_capture().unwrap();
}

#[test]
fn test_event_wait_reports_remaining_events() {
    let (session, handle) = capturing();
    session.set_event_map([("ready", "READY"), ("fault", "HardFault")]).unwrap();
    handle.emit("HardFault at 0x0800");

    let result = session
        .wait_for_event(&EventQuery::new().require("ready").avoid("fault").timeout_ms(2000))
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.remaining_required, vec!["ready"]);
    session.stop_capture().unwrap();
}

#[test]
fn test_unknown_event_rejected() {
    let (session, _handle) = capturing();
    let err = session
        .wait_for_event(&EventQuery::new().require("missing"))
        .unwrap_err();
    assert!(matches!(err, CaptureError::UnknownEvent(_)));
    session.stop_capture().unwrap();
}

#[test]
fn test_start_is_idempotent() {
    let (session, handle) = capturing();
    assert_eq!(session.start_capture().unwrap(), StartupStatus::Success);
    assert_eq!(handle.begin_calls(), 1);
    session.stop_capture().unwrap();
}

#[test]
fn test_stop_without_start_is_noop() {
    let (transport, handle) = LoopbackTransport::new();
    let session = CaptureSession::new(transport, fast_settings());
    session.stop_capture().unwrap();
    assert_eq!(session.state(), CaptureState::Idle);
    assert_eq!(handle.end_calls(), 0);
}

#[test]
fn test_restart_after_stop() {
    let (session, handle) = capturing();
    session.stop_capture().unwrap();
    assert_eq!(session.state(), CaptureState::Idle);

    session.start_capture().unwrap();
    handle.emit("again");
    let result = session
        .wait_for_trace(&TraceQuery::new().require("again").timeout_ms(2000))
        .unwrap();
    assert!(result.success);
    session.stop_capture().unwrap();
    assert_eq!(handle.begin_calls(), 2);
    assert_eq!(handle.end_calls(), 2);
}

#[test]
fn test_startup_error_then_retry() {
    let (transport, handle) = LoopbackTransport::new();
    handle.set_startup(StartupBehavior::SignalError);
    let session = CaptureSession::new(transport, fast_settings());

    let err = session.start_capture().unwrap_err();
    assert!(matches!(err, CaptureError::StartupFailure { status: StartupStatus::Error }));
    assert_eq!(session.state(), CaptureState::Error);
    assert_eq!(session.startup_status(), StartupStatus::Error);
    assert_eq!(handle.end_calls(), 1);

    handle.set_startup(StartupBehavior::Succeed);
    assert_eq!(session.start_capture().unwrap(), StartupStatus::Success);
    assert!(session.is_capturing());
    session.stop_capture().unwrap();
}

#[test]
fn test_startup_without_signal() {
    let (transport, handle) = LoopbackTransport::new();
    handle.set_startup(StartupBehavior::FailWithoutSignal);
    let session = CaptureSession::new(transport, fast_settings());

    assert!(matches!(
        session.start_capture(),
        Err(CaptureError::StartupFailure { status: StartupStatus::Error })
    ));
}

#[test]
fn test_startup_timeout() {
    let (transport, handle) = LoopbackTransport::new();
    handle.set_startup_delay(Duration::from_millis(300));
    let session = CaptureSession::new(transport, fast_settings().startup_timeout_ms(50));

    assert!(matches!(
        session.start_capture(),
        Err(CaptureError::StartupFailure { status: StartupStatus::Unknown })
    ));

    // The late startup is torn down rather than left running.
    assert!(wait_until(|| handle.end_calls() == 1));
    assert!(wait_until(|| session.state() == CaptureState::Error));
}

#[test]
fn test_late_startup_keeps_failed_status() {
    let (transport, handle) = LoopbackTransport::new();
    handle.set_startup_delay(Duration::from_millis(150));
    let session = CaptureSession::new(transport, fast_settings().startup_timeout_ms(20));

    assert!(session.start_capture().is_err());
    assert_eq!(session.startup_status(), StartupStatus::Unknown);

    // Startup succeeds on the transport side after the starter gave up.
    assert!(wait_until(|| handle.end_calls() == 1));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(session.startup_status(), StartupStatus::Unknown);
    assert_eq!(session.state(), CaptureState::Error);
    assert!(!session.is_capturing());

    // A fresh start after the abandoned one works normally.
    handle.set_startup_delay(Duration::ZERO);
    assert_eq!(session.start_capture().unwrap(), StartupStatus::Success);
    session.stop_capture().unwrap();
}

#[test]
fn test_teardown_failure_reported() {
    let (session, handle) = capturing();
    handle.set_fail_teardown(true);

    let err = session.stop_capture().unwrap_err();
    assert!(matches!(err, CaptureError::ShutdownFailure(_)));
    assert_eq!(session.state(), CaptureState::Idle);
}

#[test]
fn test_link_commands() {
    let (session, handle) = capturing();
    assert!(!session.send_link_command("reset").unwrap());

    handle.set_link_management(true);
    assert!(session.send_link_command("reset").unwrap());
    assert_eq!(handle.link_commands(), vec!["reset"]);
    session.stop_capture().unwrap();
}

#[test]
fn test_held_mutex_pauses_capture() {
    let (session, handle) = capturing();
    session.acquire_hardware_mutex(1000).unwrap();

    handle.emit("while held");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(session.backlog(), 0);

    session.release_hardware_mutex();
    assert!(wait_until(|| session.backlog() == 1));
    session.stop_capture().unwrap();
}

#[test]
fn test_recovery_time_defers_release() {
    let (transport, _handle) = LoopbackTransport::new();
    let session = CaptureSession::new(transport, fast_settings().hardware_recovery_time_sec(0.2));

    session.acquire_hardware_mutex(100).unwrap();
    let start = Instant::now();
    session.release_hardware_mutex();
    assert!(start.elapsed() < Duration::from_millis(50));
    assert!(session.hardware_busy());

    assert!(matches!(
        session.acquire_hardware_mutex(20),
        Err(CaptureError::MutexAcquisitionTimeout { timeout_ms: 20 })
    ));
    session.acquire_hardware_mutex(1000).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
    session.release_hardware_mutex();
}

#[test]
fn test_drop_stops_capture() {
    let (session, handle) = capturing();
    drop(session);
    assert_eq!(handle.end_calls(), 1);
}
