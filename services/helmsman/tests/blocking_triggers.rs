//! Control-stream integration: blocking trigger round-trips, disconnect
//! cancellation, deadline behavior, and registration-first handshakes,
//! exercised against a real WebSocket connection to a mock orchestrator.

use chrono::Utc;
use helm_protocol::trigger::PushRewritePayload;
use helm_protocol::{
    ControlPayload, MistTrigger, MistTriggerResponse, Register, TriggerErrorCode, TriggerPayload,
    TriggerType,
};
use helm_test_utils::MockOrchestrator;
use helmsman::control::transport::{ControlStream, ControlStreamConfig};
use helmsman::control::triggers::TriggerDispatcher;
use helmsman::control::{IngestError, OrchestratorLink};
use std::time::Duration;

fn test_register(node_id: &str) -> Register {
    Register {
        node_id: node_id.to_owned(),
        roles: vec!["edge".to_owned()],
        cap_ingest: true,
        cap_edge: true,
        cap_storage: true,
        cap_processing: false,
        storage_local: true,
        storage_bucket: None,
        storage_prefix: None,
        enrollment_token: None,
        fingerprint: "fp-test".to_owned(),
        cpu_cores: 4,
        memory_gb: 8,
        disk_gb: 100,
        requested_mode: None,
    }
}

fn push_rewrite_trigger(node_id: &str, request_id: &str) -> MistTrigger {
    MistTrigger {
        trigger_type: TriggerType::PushRewrite,
        node_id: node_id.to_owned(),
        timestamp: Utc::now(),
        blocking: true,
        request_id: request_id.to_owned(),
        payload: TriggerPayload::PushRewrite(PushRewritePayload {
            push_url: "rtmp://x/live/s".to_owned(),
            hostname: "1.2.3.4".to_owned(),
            stream_name: "live+s".to_owned(),
        }),
    }
}

async fn connected_stream(orchestrator: &MockOrchestrator) -> ControlStream {
    let (stream, _inbound) = ControlStream::start(
        ControlStreamConfig::new(orchestrator.url()),
        test_register("edge-test"),
    );
    orchestrator
        .wait_for_connection(Duration::from_secs(2))
        .await;
    stream
}

#[tokio::test]
async fn register_is_the_first_message_on_every_connection() {
    let orchestrator = MockOrchestrator::start().await;
    let stream = connected_stream(&orchestrator).await;

    orchestrator
        .wait_for(
            |m| matches!(m.payload, ControlPayload::Register(_)),
            Duration::from_secs(2),
        )
        .await
        .expect("register should arrive");
    let first = orchestrator.received().into_iter().next().unwrap();
    assert!(
        matches!(first.payload, ControlPayload::Register(_)),
        "register must precede all other traffic"
    );

    // Force a reconnect; the new connection registers again, first.
    orchestrator.kick();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orchestrator.connection_count() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "no reconnect");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let registers = orchestrator
        .received()
        .into_iter()
        .filter(|m| matches!(m.payload, ControlPayload::Register(_)))
        .count();
    assert!(registers >= 2, "reconnect must re-register");
    drop(stream);
}

#[tokio::test]
async fn blocking_trigger_round_trip_returns_orchestrator_response() {
    let orchestrator = MockOrchestrator::start().await;
    orchestrator.set_trigger_responder(|trigger| {
        Some(MistTriggerResponse {
            request_id: trigger.request_id.clone(),
            response: "live+s?token=ok".to_owned(),
            abort: false,
            error_code: TriggerErrorCode::Unspecified,
        })
    });
    let stream = connected_stream(&orchestrator).await;
    let dispatcher = TriggerDispatcher::new(stream.clone(), 2000);

    let outcome = dispatcher
        .send_mist_trigger(push_rewrite_trigger("edge-test", "r1"))
        .await
        .expect("blocking trigger should resolve");

    assert_eq!(outcome.response, "live+s?token=ok");
    assert!(!outcome.abort);
    assert_eq!(outcome.error_code, TriggerErrorCode::Unspecified);
    assert!(stream.pending().is_empty(), "pending map must be clean");
}

#[tokio::test]
async fn blocking_trigger_survives_disconnect_and_reconnect_inside_grace() {
    let orchestrator = MockOrchestrator::start().await;
    let stream = connected_stream(&orchestrator).await;
    let dispatcher = TriggerDispatcher::new(stream.clone(), 2000);

    // First attempt goes unanswered; the responder only answers once the
    // second connection is up.
    let task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move {
            dispatcher
                .send_mist_trigger(push_rewrite_trigger("edge-test", "r2"))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.set_trigger_responder(|trigger| {
        Some(MistTriggerResponse {
            request_id: trigger.request_id.clone(),
            response: "ack".to_owned(),
            abort: false,
            error_code: TriggerErrorCode::Unspecified,
        })
    });
    orchestrator.kick();

    let outcome = task.await.unwrap().expect("trigger should resolve");
    assert_eq!(outcome.response, "ack");
    assert!(!outcome.abort);
    assert!(stream.pending().is_empty(), "pending map must be clean");
    assert!(orchestrator.connection_count() >= 2, "reconnect expected");
}

#[tokio::test]
async fn unanswered_blocking_trigger_times_out_with_abort() {
    let orchestrator = MockOrchestrator::start().await;
    // No trigger responder: the request is never answered.
    let stream = connected_stream(&orchestrator).await;
    let dispatcher = TriggerDispatcher::new(stream.clone(), 2000);

    let started = tokio::time::Instant::now();
    let outcome = dispatcher
        .send_mist_trigger(push_rewrite_trigger("edge-test", "r3"))
        .await
        .expect("deadline yields an outcome, not an error");
    let elapsed = started.elapsed();

    assert!(outcome.abort);
    assert_eq!(outcome.error_code, TriggerErrorCode::Timeout);
    assert!(
        elapsed >= Duration::from_millis(4800) && elapsed < Duration::from_secs(8),
        "deadline should fire at ~5s, got {elapsed:?}"
    );
    assert!(stream.pending().is_empty(), "pending map must be clean");
}

#[tokio::test]
async fn pending_rpc_wakes_with_internal_on_disconnect() {
    let orchestrator = MockOrchestrator::start().await;
    // No freeze responder: the RPC stays pending until the disconnect.
    let stream = connected_stream(&orchestrator).await;

    let rpc = tokio::spawn({
        let stream = stream.clone();
        async move {
            stream
                .freeze_permission(helm_protocol::FreezePermissionRequest {
                    request_id: "f-disc".to_owned(),
                    asset_type: helm_protocol::AssetType::Clip,
                    asset_hash: "c1".to_owned(),
                    local_path: "/tmp/c1.mp4".to_owned(),
                    size_bytes: 1,
                    filenames: vec!["c1.mp4".to_owned()],
                    node_id: "edge-test".to_owned(),
                })
                .await
        }
    });

    orchestrator
        .wait_for(
            |m| matches!(m.payload, ControlPayload::FreezePermissionRequest(_)),
            Duration::from_secs(2),
        )
        .await
        .expect("request should arrive");

    let kicked_at = tokio::time::Instant::now();
    orchestrator.kick();
    let result = tokio::time::timeout(Duration::from_secs(2), rpc)
        .await
        .expect("caller must wake promptly after disconnect")
        .unwrap();

    assert!(matches!(result, Err(IngestError::Internal(_))));
    assert!(
        kicked_at.elapsed() < Duration::from_secs(2),
        "wake must be immediate, not deadline-driven"
    );
    assert!(stream.pending().is_empty(), "pending map must be clean");
}

#[tokio::test]
async fn non_blocking_trigger_is_fire_and_forget() {
    let orchestrator = MockOrchestrator::start().await;
    let stream = connected_stream(&orchestrator).await;
    let dispatcher = TriggerDispatcher::new(stream.clone(), 2000);

    let trigger = MistTrigger {
        trigger_type: TriggerType::StreamEnd,
        node_id: "edge-test".to_owned(),
        timestamp: Utc::now(),
        blocking: false,
        request_id: "r-nb".to_owned(),
        payload: TriggerPayload::StreamEnd(helm_protocol::trigger::StreamEndPayload {
            stream_name: "live+s".to_owned(),
            downloaded_bytes: 1,
            uploaded_bytes: 2,
            total_viewers: 3,
            total_inputs: 1,
            total_outputs: 1,
            viewer_seconds: 60,
        }),
    };
    let outcome = dispatcher.send_mist_trigger(trigger).await.unwrap();
    assert!(!outcome.abort);
    assert!(outcome.response.is_empty());

    orchestrator
        .wait_for(
            |m| matches!(&m.payload, ControlPayload::MistTrigger(t) if !t.blocking),
            Duration::from_secs(2),
        )
        .await
        .expect("non-blocking trigger should be enqueued and framed");
    assert!(stream.pending().is_empty(), "nothing registered for fire-and-forget");
}
