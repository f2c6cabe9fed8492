//! Orchestrator control-stream client.
//!
//! Maintains one long-lived WebSocket to the orchestrator, carrying
//! length-delimited JSON `ControlMessage` frames in both directions.
//!
//! # Protocol
//! 1. Connect to `address` (ws:// or wss://)
//! 2. Send `Register` before any other traffic
//! 3. Heartbeat every 30 s while connected
//! 4. On any transport error: tear down, fail pending requests, bump the
//!    disconnect epoch, redial with jittered exponential backoff
//!
//! An orchestrator `Error` with an `ENROLLMENT_*` code is fatal for the
//! attempt and forces the transport back into backoff.
//!
//! # Single-writer discipline
//! All outbound frames pass through one per-connection channel drained by
//! the connection task, so cross-component writes are serialized and
//! strictly ordered once enqueued.

use super::pending::PendingRequests;
use futures_util::{SinkExt, StreamExt};
use helm_protocol::{error_codes, ControlMessage, ControlPayload, Heartbeat, Register};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Configuration for the control-stream connection.
#[derive(Debug, Clone)]
pub struct ControlStreamConfig {
    /// WebSocket URL of the orchestrator control endpoint.
    pub address: String,
    pub heartbeat_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
}

impl ControlStreamConfig {
    pub fn new(address: impl Into<String>) -> Self {
        ControlStreamConfig {
            address: address.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            backoff_initial: BACKOFF_INITIAL,
            backoff_cap: BACKOFF_CAP,
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with a cap and ±25 % jitter.
///
/// Doubles on each consecutive failure; resets to the initial delay when the
/// previous connection outlived the cap (it was a healthy session, not a
/// flap).
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Backoff {
            initial,
            cap,
            current: initial,
        }
    }

    /// Compute the delay before the next attempt.
    ///
    /// `previous_lifetime` is how long the last connection survived; `None`
    /// when the dial itself failed.
    pub fn next_delay(&mut self, previous_lifetime: Option<Duration>) -> Duration {
        if previous_lifetime.is_some_and(|lived| lived > self.cap) {
            self.current = self.initial;
        }
        let base = self.current;
        self.current = (self.current * 2).min(self.cap);
        jittered(base)
    }
}

/// Apply ±25 % jitter to a base delay.
fn jittered(base: Duration) -> Duration {
    use rand::Rng;
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    base.mul_f64(factor)
}

// ---------------------------------------------------------------------------
// ControlStream handle
// ---------------------------------------------------------------------------

struct Shared {
    /// Writer slot for the current connection; `None` while disconnected.
    writer: RwLock<Option<mpsc::Sender<ControlMessage>>>,
    connected: watch::Sender<bool>,
    /// Bumped once per disconnect. Callers awaiting a response snapshot the
    /// current value and wake on change.
    disconnect_epoch: watch::Sender<u64>,
    pending: PendingRequests,
    inbound_tx: mpsc::UnboundedSender<ControlPayload>,
    /// Identity the node currently operates under. Starts as the configured
    /// id; replaced when a `ConfigSeed` is adopted.
    node_id: std::sync::RwLock<String>,
}

/// Cloneable handle to the control stream.
///
/// Explicitly constructed and injected; components hold this as a
/// capability rather than reaching for process-wide state.
#[derive(Clone)]
pub struct ControlStream {
    shared: Arc<Shared>,
}

impl ControlStream {
    /// Spawn the connection runner and return the handle plus the inbound
    /// payload receiver for the dispatcher.
    ///
    /// `register` is the registration template; its `node_id` is replaced by
    /// the currently-adopted identity on every (re)connect.
    pub fn start(
        cfg: ControlStreamConfig,
        register: Register,
    ) -> (Self, mpsc::UnboundedReceiver<ControlPayload>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        let (disconnect_epoch, _) = watch::channel(0u64);

        let shared = Arc::new(Shared {
            writer: RwLock::new(None),
            connected,
            disconnect_epoch,
            pending: PendingRequests::new(),
            inbound_tx,
            node_id: std::sync::RwLock::new(register.node_id.clone()),
        });

        let handle = ControlStream {
            shared: Arc::clone(&shared),
        };
        tokio::spawn(run_connection_loop(shared, cfg, register));
        (handle, inbound_rx)
    }

    /// Enqueue a payload for the current connection.
    ///
    /// Fails with [`super::IngestError::NotConnected`] when no stream is up;
    /// succeeding means the frame was accepted for ordered delivery.
    pub async fn send(&self, payload: ControlPayload) -> Result<(), super::IngestError> {
        let tx = {
            let slot = self.shared.writer.read().await;
            slot.clone()
        };
        let Some(tx) = tx else {
            return Err(super::IngestError::NotConnected);
        };
        tx.send(ControlMessage::new(payload))
            .await
            .map_err(|_| super::IngestError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.subscribe().borrow()
    }

    /// Watch for connection state changes (used for reconnect grace waits).
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Snapshot of the disconnect signal. Await `changed()` to wake on the
    /// next disconnect.
    pub fn disconnects(&self) -> watch::Receiver<u64> {
        self.shared.disconnect_epoch.subscribe()
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.shared.pending
    }

    /// The node identity used for all outbound messages.
    pub fn current_node_id(&self) -> String {
        self.shared
            .node_id
            .read()
            .expect("node id lock poisoned")
            .clone()
    }

    /// Adopt the orchestrator-assigned identity from a `ConfigSeed`.
    pub fn adopt_node_id(&self, node_id: &str) {
        let mut slot = self.shared.node_id.write().expect("node id lock poisoned");
        if *slot != node_id {
            info!(old = %*slot, new = %node_id, "adopting orchestrator node id");
            *slot = node_id.to_owned();
        }
    }
}

// ---------------------------------------------------------------------------
// Connection runner
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("WebSocket: {0}")]
    Ws(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("enrollment rejected: {0}")]
    Enrollment(String),
    #[error("connection closed")]
    Closed,
}

async fn run_connection_loop(shared: Arc<Shared>, cfg: ControlStreamConfig, register: Register) {
    let mut backoff = Backoff::new(cfg.backoff_initial, cfg.backoff_cap);
    loop {
        let started = Instant::now();
        let result = run_one_connection(&shared, &cfg, &register).await;
        let lived = match &result {
            Err(TransportError::Connect(_)) => None,
            _ => Some(started.elapsed()),
        };
        if let Err(e) = result {
            warn!(error = %e, "control stream disconnected");
        }

        // Tear down shared state so senders and waiters observe the loss.
        teardown(&shared).await;

        let delay = backoff.next_delay(lived);
        debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
        tokio::time::sleep(delay).await;
    }
}

async fn teardown(shared: &Shared) {
    {
        let mut slot = shared.writer.write().await;
        *slot = None;
    }
    let _ = shared.connected.send(false);
    shared.pending.fail_all();
    shared.disconnect_epoch.send_modify(|epoch| *epoch += 1);
}

async fn run_one_connection(
    shared: &Shared,
    cfg: &ControlStreamConfig,
    register: &Register,
) -> Result<(), TransportError> {
    let (ws, _response) = tokio_tungstenite::connect_async(cfg.address.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    // Register first, before any other traffic.
    let mut reg = register.clone();
    reg.node_id = shared
        .node_id
        .read()
        .expect("node id lock poisoned")
        .clone();
    let frame = serde_json::to_string(&ControlMessage::new(ControlPayload::Register(reg)))
        .map_err(|e| TransportError::Serialization(e.to_string()))?;
    sink.send(Message::Text(frame.into()))
        .await
        .map_err(|e| TransportError::Ws(e.to_string()))?;

    // Install the writer slot and announce connectivity.
    let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(OUTBOUND_QUEUE);
    {
        let mut slot = shared.writer.write().await;
        *slot = Some(out_tx);
    }
    let _ = shared.connected.send(true);
    info!(address = %cfg.address, "control stream connected");

    let mut heartbeat = tokio::time::interval(cfg.heartbeat_interval);
    heartbeat.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            Some(msg) = out_rx.recv() => {
                let json = serde_json::to_string(&msg)
                    .map_err(|e| TransportError::Serialization(e.to_string()))?;
                sink.send(Message::Text(json.into()))
                    .await
                    .map_err(|e| TransportError::Ws(e.to_string()))?;
            }
            _ = heartbeat.tick() => {
                let node_id = shared.node_id.read().expect("node id lock poisoned").clone();
                let hb = ControlMessage::new(ControlPayload::Heartbeat(Heartbeat { node_id }));
                let json = serde_json::to_string(&hb)
                    .map_err(|e| TransportError::Serialization(e.to_string()))?;
                sink.send(Message::Text(json.into()))
                    .await
                    .map_err(|e| TransportError::Ws(e.to_string()))?;
            }
            inbound = stream.next() => {
                match inbound {
                    None => return Err(TransportError::Closed),
                    Some(Err(e)) => return Err(TransportError::Ws(e.to_string())),
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(shared, &text)?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => return Err(TransportError::Closed),
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn handle_inbound(shared: &Shared, text: &str) -> Result<(), TransportError> {
    let msg: ControlMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "unparseable control frame");
            return Ok(());
        }
    };

    if let ControlPayload::Error(err) = &msg.payload {
        if error_codes::is_enrollment(&err.code) {
            return Err(TransportError::Enrollment(format!(
                "{}: {}",
                err.code, err.message
            )));
        }
        warn!(code = %err.code, message = %err.message, "orchestrator error");
        return Ok(());
    }

    // Responses route to their waiter; everything else to the dispatcher.
    if let Some(request_id) = msg.payload.response_request_id() {
        if !shared.pending.complete(request_id, msg.payload.clone()) {
            debug!(request_id = %request_id, "response for unknown request id");
        }
        return Ok(());
    }

    let _ = shared.inbound_tx.send(msg.payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The delay between the n-th and (n+1)-th attempt lies in
    /// `[0.75·d, 1.25·d]` with `d = min(1s·2^n, 30s)`.
    #[test]
    fn backoff_delays_stay_within_jitter_bounds() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let expected_bases = [1u64, 2, 4, 8, 16, 30, 30, 30];
        for base_secs in expected_bases {
            let delay = backoff.next_delay(Some(Duration::from_millis(100)));
            let base = Duration::from_secs(base_secs);
            assert!(
                delay >= base.mul_f64(0.75) && delay <= base.mul_f64(1.25),
                "delay {delay:?} out of bounds for base {base:?}"
            );
        }
    }

    #[test]
    fn backoff_resets_after_long_lived_connection() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        // Grow past the first doubling.
        let _ = backoff.next_delay(Some(Duration::from_millis(10)));
        let _ = backoff.next_delay(Some(Duration::from_millis(10)));
        let grown = backoff.next_delay(Some(Duration::from_millis(10)));
        assert!(grown >= Duration::from_secs(3), "expected ≥ 4s base, got {grown:?}");

        // A connection that outlived the cap resets the ladder.
        let reset = backoff.next_delay(Some(Duration::from_secs(31)));
        assert!(
            reset <= Duration::from_millis(1250),
            "expected ~1s base after reset, got {reset:?}"
        );
    }

    #[test]
    fn backoff_failed_dial_keeps_growing() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let first = backoff.next_delay(None);
        let second = backoff.next_delay(None);
        assert!(first <= Duration::from_millis(1250));
        assert!(second >= Duration::from_millis(1500), "got {second:?}");
    }
}
