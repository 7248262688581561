//! Async wait wrappers on a tokio runtime

use std::time::Duration;
use tracewait_core::{CaptureSession, CaptureSettings, EventQuery, LoopbackTransport, TraceQuery};

fn settings() -> CaptureSettings {
    CaptureSettings::default().poll_interval_ms(5)
}

#[tokio::test]
async fn test_wait_for_trace_async() {
    let (transport, handle) = LoopbackTransport::new();
    let session = CaptureSession::new(transport, settings());
    session.start_capture().unwrap();

    let emitter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.emit("link up");
    });

    let result = session
        .wait_for_trace_async(TraceQuery::new().require("link up").timeout_ms(2000))
        .await
        .unwrap();
    emitter.await.unwrap();

    assert!(result.success);
    session.stop_capture().unwrap();
}

#[tokio::test]
async fn test_wait_for_event_async_times_out() {
    let (transport, _handle) = LoopbackTransport::new();
    let session = CaptureSession::new(transport, settings());
    session.set_event_map([("ready", "READY")]).unwrap();
    session.start_capture().unwrap();

    let result = session
        .wait_for_event_async(EventQuery::new().require("ready").timeout_ms(50))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.remaining_required, vec!["ready"]);
    session.stop_capture().unwrap();
}
