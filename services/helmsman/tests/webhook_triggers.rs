//! Webhook surface integration: trigger bodies in, orchestrator-decided
//! responses out, over real HTTP against a live control stream.

use helm_protocol::{ControlPayload, MistTriggerResponse, Register, TriggerErrorCode};
use helm_test_utils::MockOrchestrator;
use helmsman::control::transport::{ControlStream, ControlStreamConfig};
use helmsman::control::triggers::TriggerDispatcher;
use helmsman::webhooks::{router, WebhookState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct WebhookFixture {
    orchestrator: MockOrchestrator,
    base_url: String,
    segment_paths: Arc<Mutex<Vec<String>>>,
    ready: Arc<AtomicBool>,
}

async fn webhook_fixture() -> WebhookFixture {
    let orchestrator = MockOrchestrator::start().await;
    let (control, _inbound) = ControlStream::start(
        ControlStreamConfig::new(orchestrator.url()),
        Register {
            node_id: "edge-test".to_owned(),
            roles: vec!["edge".to_owned()],
            cap_ingest: true,
            cap_edge: true,
            cap_storage: true,
            cap_processing: false,
            storage_local: true,
            storage_bucket: None,
            storage_prefix: None,
            enrollment_token: None,
            fingerprint: "fp".to_owned(),
            cpu_cores: 2,
            memory_gb: 4,
            disk_gb: 50,
            requested_mode: None,
        },
    );
    orchestrator
        .wait_for_connection(Duration::from_secs(2))
        .await;

    let segment_paths = Arc::new(Mutex::new(Vec::new()));
    let hook_paths = Arc::clone(&segment_paths);
    let ready = Arc::new(AtomicBool::new(true));
    let state = WebhookState {
        dispatcher: TriggerDispatcher::new(control.clone(), 2000),
        control,
        segment_hook: Arc::new(move |path| hook_paths.lock().unwrap().push(path)),
        ready: Arc::clone(&ready),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });

    WebhookFixture {
        orchestrator,
        base_url,
        segment_paths,
        ready,
    }
}

#[tokio::test]
async fn blocking_webhook_returns_the_orchestrator_response_body() {
    let fx = webhook_fixture().await;
    fx.orchestrator.set_trigger_responder(|trigger| {
        Some(MistTriggerResponse {
            request_id: trigger.request_id.clone(),
            response: "live+s?token=ok".to_owned(),
            abort: false,
            error_code: TriggerErrorCode::Unspecified,
        })
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/webhooks/mist/PUSH_REWRITE", fx.base_url))
        .body("rtmp://x/live/s\r\n1.2.3.4\r\nlive+s")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "live+s?token=ok");
}

#[tokio::test]
async fn aborted_trigger_surfaces_as_non_success_status() {
    let fx = webhook_fixture().await;
    fx.orchestrator.set_trigger_responder(|trigger| {
        Some(MistTriggerResponse {
            request_id: trigger.request_id.clone(),
            response: "denied".to_owned(),
            abort: true,
            error_code: TriggerErrorCode::Unspecified,
        })
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/webhooks/mist/PUSH_REWRITE", fx.base_url))
        .body("rtmp://x/live/s\n1.2.3.4\nlive+s")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert_eq!(response.text().await.unwrap(), "denied");
}

#[tokio::test]
async fn non_blocking_webhook_returns_200_immediately() {
    let fx = webhook_fixture().await;
    // No responder scripted: a blocking trigger would stall, a
    // non-blocking one must not.
    let client = reqwest::Client::new();
    let started = tokio::time::Instant::now();
    let response = client
        .post(format!("{}/webhooks/mist/STREAM_END", fx.base_url))
        .body("live+s\n100\n200\n3\n1\n2\n60")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(started.elapsed() < Duration::from_secs(1));

    fx.orchestrator
        .wait_for(
            |m| matches!(&m.payload, ControlPayload::MistTrigger(t) if !t.blocking),
            Duration::from_secs(2),
        )
        .await
        .expect("trigger should reach the orchestrator");
}

#[tokio::test]
async fn recording_segment_triggers_the_dvr_hook() {
    let fx = webhook_fixture().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/webhooks/mist/RECORDING_SEGMENT", fx.base_url))
        .body("live+s\n/data/dvr/s1/d1/segments/12_0.ts\n6.0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        *fx.segment_paths.lock().unwrap(),
        vec!["/data/dvr/s1/d1/segments/12_0.ts"]
    );
}

#[tokio::test]
async fn unknown_trigger_names_and_bad_bodies_are_rejected() {
    let fx = webhook_fixture().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/webhooks/mist/NOT_A_TRIGGER", fx.base_url))
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("{}/webhooks/mist/PUSH_REWRITE", fx.base_url))
        .body("only-one-line")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn health_endpoints_reflect_readiness() {
    let fx = webhook_fixture().await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/healthz", fx.base_url)).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let ready = client.get(format!("{}/readyz", fx.base_url)).send().await.unwrap();
    assert_eq!(ready.status(), 200);

    fx.ready.store(false, Ordering::Relaxed);
    let not_ready = client.get(format!("{}/readyz", fx.base_url)).send().await.unwrap();
    assert_eq!(not_ready.status(), 503);
}
