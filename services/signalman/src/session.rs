//! Client WebSocket sessions.
//!
//! Each connection runs two pumps: the read pump consumes subscription
//! control messages under a pong deadline, the write pump drains the
//! bounded delivery queue (coalescing ready messages into one frame) and
//! pings on an interval. Either pump exiting unregisters the session.

use crate::hub::{Hub, SessionHandle, SESSION_QUEUE_DEPTH};
use crate::messages::{HubMessage, SubscriptionAction, SubscriptionControl};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const PONG_WAIT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Authentication seam
// ---------------------------------------------------------------------------

/// Identity attached to an authenticated session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

/// Token check abstraction; the policy itself lives elsewhere.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Option<Claims>;
}

/// Shared-secret verifier for service-to-service sessions.
///
/// Tokens of the form `{secret}:{tenant_id}[:{user_id}]` scope the session;
/// the bare secret grants an infrastructure session with no tenant.
pub struct ServiceTokenVerifier {
    secret: String,
}

impl ServiceTokenVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        ServiceTokenVerifier {
            secret: secret.into(),
        }
    }
}

impl TokenVerifier for ServiceTokenVerifier {
    fn verify(&self, token: &str) -> Option<Claims> {
        let mut parts = token.splitn(3, ':');
        let secret = parts.next()?;
        if secret != self.secret {
            return None;
        }
        Some(Claims {
            tenant_id: parts.next().filter(|t| !t.is_empty()).map(ToOwned::to_owned),
            user_id: parts.next().filter(|u| !u.is_empty()).map(ToOwned::to_owned),
        })
    }
}

pub fn extract_bearer(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ")
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct SessionState<V: TokenVerifier> {
    pub hub: Hub,
    pub verifier: Arc<V>,
}

impl<V: TokenVerifier> Clone for SessionState<V> {
    fn clone(&self) -> Self {
        SessionState {
            hub: self.hub.clone(),
            verifier: Arc::clone(&self.verifier),
        }
    }
}

pub fn router<V: TokenVerifier>(state: SessionState<V>) -> Router {
    Router::new()
        .route("/ws/v1/events", get(ws_handler::<V>))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .with_state(state)
}

async fn ws_handler<V: TokenVerifier>(
    ws: WebSocketUpgrade,
    State(state): State<SessionState<V>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned);

    // Sessions are optionally authenticated, but a presented token must be
    // valid.
    let claims = match token {
        Some(token) => match state.verifier.verify(&token) {
            Some(claims) => claims,
            None => return StatusCode::UNAUTHORIZED.into_response(),
        },
        None => Claims::default(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, claims))
        .into_response()
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, hub: Hub, claims: Claims) {
    let session_id = Uuid::new_v4().to_string();
    let (queue_tx, queue_rx) = mpsc::channel::<Arc<HubMessage>>(SESSION_QUEUE_DEPTH);
    hub.register(SessionHandle {
        session_id: session_id.clone(),
        queue: queue_tx,
        subscribed_channels: HashSet::new(),
        user_id: claims.user_id.clone(),
        tenant_id: claims.tenant_id.clone(),
    });
    info!(session_id = %session_id, tenant = ?claims.tenant_id, "hub session connected");

    let (sender, receiver) = socket.split();
    let (pong_tx, pong_rx) = mpsc::unbounded_channel();

    let writer_hub = hub.clone();
    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        write_pump(sender, queue_rx, pong_rx).await;
        writer_hub.unregister(&writer_session);
    });

    read_pump(receiver, &hub, &session_id, pong_tx).await;
    hub.unregister(&session_id);
    writer.abort();
    info!(session_id = %session_id, "hub session ended");
}

/// Consume subscription control under the pong deadline.
async fn read_pump(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    hub: &Hub,
    session_id: &str,
    pong_tx: mpsc::UnboundedSender<axum::body::Bytes>,
) {
    loop {
        match tokio::time::timeout(PONG_WAIT, receiver.next()).await {
            Err(_) => {
                warn!(session_id = %session_id, "pong deadline exceeded");
                return;
            }
            Ok(None) | Ok(Some(Err(_))) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<SubscriptionControl>(&text) {
                    Ok(control) => apply_control(hub, session_id, control),
                    Err(e) => debug!(session_id = %session_id, error = %e, "bad control message"),
                }
            }
            Ok(Some(Ok(Message::Ping(data)))) => {
                let _ = pong_tx.send(data);
            }
            Ok(Some(Ok(Message::Pong(_)))) => {} // deadline extends on next recv
            Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(Message::Binary(_)))) => {}
        }
    }
}

fn apply_control(hub: &Hub, session_id: &str, control: SubscriptionControl) {
    match control.action {
        SubscriptionAction::Subscribe => {
            hub.subscribe(
                session_id,
                control.channels,
                control.user_id,
                control.tenant_id,
            );
        }
        SubscriptionAction::Unsubscribe => hub.unsubscribe(session_id, control.channels),
    }
}

/// Drain the delivery queue, coalescing ready messages into one frame, and
/// ping on an interval.
async fn write_pump(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut queue_rx: mpsc::Receiver<Arc<HubMessage>>,
    mut pong_rx: mpsc::UnboundedReceiver<axum::body::Bytes>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            maybe = queue_rx.recv() => {
                let Some(first) = maybe else { return };
                let mut batch = vec![first];
                while batch.len() < 32 {
                    match queue_rx.try_recv() {
                        Ok(next) => batch.push(next),
                        Err(_) => break,
                    }
                }
                let frame = encode_frame(&batch);
                if frame.is_empty() {
                    continue;
                }
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            Some(data) = pong_rx.recv() => {
                if sender.send(Message::Pong(data)).await.is_err() {
                    return;
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Newline-joined JSON documents; one transport frame per drain.
fn encode_frame(batch: &[Arc<HubMessage>]) -> String {
    batch
        .iter()
        .filter_map(|m| serde_json::to_string(m.as_ref()).ok())
        .collect::<Vec<_>>()
        .join("\n")
}
