//! Scriptable mock orchestrator.
//!
//! Accepts control-stream connections, records every inbound
//! `ControlMessage`, answers freeze-permission / can-delete / blocking
//! trigger requests through configurable responders, and lets tests push
//! orchestrator-initiated payloads or drop the connection to exercise
//! reconnects.

use futures_util::{SinkExt, StreamExt};
use helm_protocol::{
    CanDeleteRequest, CanDeleteResponse, ControlMessage, ControlPayload, FreezePermissionRequest,
    FreezePermissionResponse, MistTrigger, MistTriggerResponse,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

type FreezeResponder =
    Arc<dyn Fn(&FreezePermissionRequest) -> FreezePermissionResponse + Send + Sync>;
type CanDeleteResponder = Arc<dyn Fn(&CanDeleteRequest) -> CanDeleteResponse + Send + Sync>;
type TriggerResponder = Arc<dyn Fn(&MistTrigger) -> Option<MistTriggerResponse> + Send + Sync>;

#[derive(Default)]
struct Responders {
    freeze: Mutex<Option<FreezeResponder>>,
    can_delete: Mutex<Option<CanDeleteResponder>>,
    trigger: Mutex<Option<TriggerResponder>>,
}

struct Shared {
    received: Mutex<Vec<ControlMessage>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ControlPayload>>>,
    kick: Notify,
    responders: Responders,
    connections: AtomicUsize,
}

/// One-session-at-a-time mock orchestrator.
pub struct MockOrchestrator {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockOrchestrator {
    /// Bind on an ephemeral port and start accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock orchestrator");
        let local_addr = listener.local_addr().expect("local_addr after bind");
        let shared = Arc::new(Shared {
            received: Mutex::new(Vec::new()),
            outbound: Mutex::new(None),
            kick: Notify::new(),
            responders: Responders::default(),
            connections: AtomicUsize::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let session_shared = Arc::clone(&accept_shared);
                tokio::spawn(async move { serve_session(stream, session_shared).await });
            }
        });

        MockOrchestrator { local_addr, shared }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// All recorded inbound messages, oldest first.
    pub fn received(&self) -> Vec<ControlMessage> {
        self.shared.received.lock().expect("received lock").clone()
    }

    /// Total connections accepted so far (reconnects increment this).
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Wait until the first message matching `predicate` is recorded.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Option<ControlMessage>
    where
        F: Fn(&ControlMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.received().into_iter().find(|m| predicate(m)) {
                return Some(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until a client session is connected.
    pub async fn wait_for_connection(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.shared.outbound.lock().expect("outbound lock").is_none() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no client connected within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Push an orchestrator-initiated payload to the connected client.
    pub fn push(&self, payload: ControlPayload) {
        if let Some(tx) = self.shared.outbound.lock().expect("outbound lock").as_ref() {
            let _ = tx.send(payload);
        }
    }

    /// Drop the current connection (the client should reconnect).
    pub fn kick(&self) {
        self.shared.kick.notify_waiters();
    }

    // -----------------------------------------------------------------------
    // Responders
    // -----------------------------------------------------------------------

    pub fn set_freeze_responder<F>(&self, responder: F)
    where
        F: Fn(&FreezePermissionRequest) -> FreezePermissionResponse + Send + Sync + 'static,
    {
        *self.shared.responders.freeze.lock().expect("responder lock") = Some(Arc::new(responder));
    }

    pub fn set_can_delete_responder<F>(&self, responder: F)
    where
        F: Fn(&CanDeleteRequest) -> CanDeleteResponse + Send + Sync + 'static,
    {
        *self
            .shared
            .responders
            .can_delete
            .lock()
            .expect("responder lock") = Some(Arc::new(responder));
    }

    /// Respond to blocking triggers. Returning `None` leaves the trigger
    /// unanswered (for deadline tests).
    pub fn set_trigger_responder<F>(&self, responder: F)
    where
        F: Fn(&MistTrigger) -> Option<MistTriggerResponse> + Send + Sync + 'static,
    {
        *self.shared.responders.trigger.lock().expect("responder lock") = Some(Arc::new(responder));
    }
}

// ---------------------------------------------------------------------------
// Per-session loop
// ---------------------------------------------------------------------------

async fn serve_session(stream: tokio::net::TcpStream, shared: Arc<Shared>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    shared.connections.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut source) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ControlPayload>();
    {
        let mut slot = shared.outbound.lock().expect("outbound lock");
        *slot = Some(out_tx);
    }

    loop {
        tokio::select! {
            () = shared.kick.notified() => break,
            Some(payload) = out_rx.recv() => {
                let msg = ControlMessage::new(payload);
                let Ok(json) = serde_json::to_string(&msg) else { continue };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = source.next() => {
                match inbound {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Text(text))) => {
                        let Ok(msg) = serde_json::from_str::<ControlMessage>(&text) else {
                            debug!(frame = %text, "unparseable frame");
                            continue;
                        };
                        if let Some(reply) = scripted_reply(&shared, &msg.payload) {
                            let envelope = ControlMessage::new(reply);
                            if let Ok(json) = serde_json::to_string(&envelope) {
                                let _ = sink.send(Message::Text(json.into())).await;
                            }
                        }
                        shared.received.lock().expect("received lock").push(msg);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let mut slot = shared.outbound.lock().expect("outbound lock");
    *slot = None;
}

fn scripted_reply(shared: &Shared, payload: &ControlPayload) -> Option<ControlPayload> {
    match payload {
        ControlPayload::FreezePermissionRequest(request) => {
            let responder = shared.responders.freeze.lock().expect("responder lock");
            responder
                .as_ref()
                .map(|f| ControlPayload::FreezePermissionResponse(f(request)))
        }
        ControlPayload::CanDeleteRequest(request) => {
            let responder = shared
                .responders
                .can_delete
                .lock()
                .expect("responder lock");
            responder
                .as_ref()
                .map(|f| ControlPayload::CanDeleteResponse(f(request)))
        }
        ControlPayload::MistTrigger(trigger) if trigger.blocking => {
            let responder = shared.responders.trigger.lock().expect("responder lock");
            responder
                .as_ref()
                .and_then(|f| f(trigger))
                .map(ControlPayload::MistTriggerResponse)
        }
        _ => None,
    }
}
