//! The fan-out hub.
//!
//! A single hub task owns the client set; register, unregister and
//! broadcast arrive on three unbounded channels fed by the session pumps
//! and the topic consumers. Nothing outside the run loop ever mutates the
//! client set.
//!
//! # Routing rules, evaluated per session
//! 1. The session must subscribe to the message's channel (`"all"` matches
//!    any channel).
//! 2. Tenant-scoped messages require an exact tenant match.
//! 3. Tenant-less (infrastructure) messages are delivered only to sessions
//!    subscribed to `"system"`.
//! 4. User-scoped message types are narrowed to the session whose
//!    `user_id` matches the payload's session id.
//!
//! # Backpressure
//! Each session's outbound queue is bounded; a send that would block
//! closes the session and removes it from the hub.

use crate::messages::{HubMessage, ALL_CHANNELS, SYSTEM_CHANNEL};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound queue depth per session.
pub const SESSION_QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Session registration
// ---------------------------------------------------------------------------

/// What the hub stores per connected session.
pub struct SessionHandle {
    pub session_id: String,
    pub queue: mpsc::Sender<Arc<HubMessage>>,
    pub subscribed_channels: HashSet<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

/// Register-channel traffic: new sessions and subscription control.
pub enum RegisterMsg {
    Session(SessionHandle),
    Subscribe {
        session_id: String,
        channels: Vec<String>,
        user_id: Option<String>,
        tenant_id: Option<String>,
    },
    Unsubscribe {
        session_id: String,
        channels: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Hub handle
// ---------------------------------------------------------------------------

/// Cloneable handle feeding the hub task.
#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::UnboundedSender<RegisterMsg>,
    unregister_tx: mpsc::UnboundedSender<String>,
    broadcast_tx: mpsc::UnboundedSender<HubMessage>,
    session_count: Arc<AtomicUsize>,
}

impl Hub {
    /// Spawn the hub task and return its handle.
    pub fn start() -> Self {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let session_count = Arc::new(AtomicUsize::new(0));

        let runner = HubRunner {
            sessions: HashMap::new(),
            session_count: Arc::clone(&session_count),
        };
        tokio::spawn(runner.run(register_rx, unregister_rx, broadcast_rx));

        Hub {
            register_tx,
            unregister_tx,
            broadcast_tx,
            session_count,
        }
    }

    pub fn register(&self, session: SessionHandle) {
        let _ = self.register_tx.send(RegisterMsg::Session(session));
    }

    pub fn unregister(&self, session_id: &str) {
        let _ = self.unregister_tx.send(session_id.to_owned());
    }

    pub fn subscribe(
        &self,
        session_id: &str,
        channels: Vec<String>,
        user_id: Option<String>,
        tenant_id: Option<String>,
    ) {
        let _ = self.register_tx.send(RegisterMsg::Subscribe {
            session_id: session_id.to_owned(),
            channels,
            user_id,
            tenant_id,
        });
    }

    pub fn unsubscribe(&self, session_id: &str, channels: Vec<String>) {
        let _ = self.register_tx.send(RegisterMsg::Unsubscribe {
            session_id: session_id.to_owned(),
            channels,
        });
    }

    pub fn broadcast(&self, message: HubMessage) {
        let _ = self.broadcast_tx.send(message);
    }

    /// Tenant-scoped broadcast.
    pub fn broadcast_to_tenant(
        &self,
        tenant_id: &str,
        message_type: &str,
        channel: &str,
        data: serde_json::Value,
    ) {
        self.broadcast(HubMessage::tenant(tenant_id, message_type, channel, data));
    }

    /// Infrastructure broadcast: `"system"` subscribers only.
    pub fn broadcast_infrastructure(&self, message_type: &str, data: serde_json::Value) {
        self.broadcast(HubMessage::infrastructure(message_type, data));
    }

    /// Snapshot for stats surfaces; the hub task is the single writer.
    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Hub task
// ---------------------------------------------------------------------------

struct HubRunner {
    sessions: HashMap<String, SessionHandle>,
    session_count: Arc<AtomicUsize>,
}

impl HubRunner {
    async fn run(
        mut self,
        mut register_rx: mpsc::UnboundedReceiver<RegisterMsg>,
        mut unregister_rx: mpsc::UnboundedReceiver<String>,
        mut broadcast_rx: mpsc::UnboundedReceiver<HubMessage>,
    ) {
        loop {
            // Registration and subscription control settle before deliveries
            // so routing always reflects everything the pumps sent first.
            tokio::select! {
                biased;
                Some(msg) = register_rx.recv() => self.handle_register(msg),
                Some(session_id) = unregister_rx.recv() => self.remove(&session_id, "unregistered"),
                Some(message) = broadcast_rx.recv() => self.deliver(message),
                else => break,
            }
        }
    }

    fn handle_register(&mut self, msg: RegisterMsg) {
        match msg {
            RegisterMsg::Session(session) => {
                debug!(session_id = %session.session_id, "session registered");
                self.sessions.insert(session.session_id.clone(), session);
                self.session_count.store(self.sessions.len(), Ordering::Relaxed);
            }
            RegisterMsg::Subscribe {
                session_id,
                channels,
                user_id,
                tenant_id,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    for channel in channels {
                        session.subscribed_channels.insert(channel);
                    }
                    if user_id.is_some() {
                        session.user_id = user_id;
                    }
                    if tenant_id.is_some() {
                        session.tenant_id = tenant_id;
                    }
                }
            }
            RegisterMsg::Unsubscribe {
                session_id,
                channels,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    for channel in &channels {
                        session.subscribed_channels.remove(channel);
                    }
                }
            }
        }
    }

    fn remove(&mut self, session_id: &str, why: &str) {
        if self.sessions.remove(session_id).is_some() {
            info!(session_id = %session_id, why, "session removed");
            self.session_count.store(self.sessions.len(), Ordering::Relaxed);
        }
    }

    fn deliver(&mut self, message: HubMessage) {
        let message = Arc::new(message);
        let mut evicted: Vec<String> = Vec::new();
        for session in self.sessions.values() {
            if !should_deliver(session, &message) {
                continue;
            }
            match session.queue.try_send(Arc::clone(&message)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %session.session_id, "send queue full, evicting session");
                    evicted.push(session.session_id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evicted.push(session.session_id.clone());
                }
            }
        }
        // Closing the queue makes the write pump exit and drain.
        for session_id in evicted {
            self.remove(&session_id, "backpressure");
        }
    }
}

/// The routing rules, in order.
pub fn should_deliver(session: &SessionHandle, message: &HubMessage) -> bool {
    let subscribed = session.subscribed_channels.contains(&message.channel)
        || session.subscribed_channels.contains(ALL_CHANNELS);
    if !subscribed {
        return false;
    }

    match &message.tenant_id {
        Some(tenant) => {
            if session.tenant_id.as_deref() != Some(tenant.as_str()) {
                return false;
            }
        }
        None => {
            if !session.subscribed_channels.contains(SYSTEM_CHANNEL) {
                return false;
            }
        }
    }

    if let Some(target) = message.target_session_id() {
        return session.user_id.as_deref() == Some(target);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn test_session(
        session_id: &str,
        channels: &[&str],
        tenant_id: Option<&str>,
        user_id: Option<&str>,
    ) -> (SessionHandle, mpsc::Receiver<Arc<HubMessage>>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        (
            SessionHandle {
                session_id: session_id.to_owned(),
                queue: tx,
                subscribed_channels: channels.iter().map(|c| (*c).to_owned()).collect(),
                user_id: user_id.map(ToOwned::to_owned),
                tenant_id: tenant_id.map(ToOwned::to_owned),
            },
            rx,
        )
    }

    async fn recv_one(
        rx: &mut mpsc::Receiver<Arc<HubMessage>>,
    ) -> Option<Arc<HubMessage>> {
        timeout(Duration::from_millis(200), rx.recv()).await.ok().flatten()
    }

    async fn wait_for_sessions(hub: &Hub, count: usize) {
        for _ in 0..100 {
            if hub.session_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("hub never reached {count} sessions");
    }

    #[tokio::test]
    async fn tenant_isolation_and_system_exclusivity() {
        let hub = Hub::start();
        let (a, mut a_rx) = test_session("a", &["streams"], Some("t1"), None);
        let (b, mut b_rx) = test_session("b", &["streams"], Some("t2"), None);
        let (c, mut c_rx) = test_session("c", &["system"], None, None);
        hub.register(a);
        hub.register(b);
        hub.register(c);
        wait_for_sessions(&hub, 3).await;

        hub.broadcast_to_tenant("t1", "stream_lifecycle", "streams", json!({"s": 1}));
        hub.broadcast_infrastructure("node_lifecycle", json!({"node": "edge-1"}));

        let got_a = recv_one(&mut a_rx).await.expect("A gets tenant broadcast");
        assert_eq!(got_a.message_type, "stream_lifecycle");
        assert!(recv_one(&mut a_rx).await.is_none(), "A must not see infra");

        assert!(recv_one(&mut b_rx).await.is_none(), "B sees neither");

        let got_c = recv_one(&mut c_rx).await.expect("C gets infra broadcast");
        assert_eq!(got_c.message_type, "node_lifecycle");
        assert!(recv_one(&mut c_rx).await.is_none());
    }

    #[tokio::test]
    async fn all_subscription_matches_any_channel_with_tenant_rules_intact() {
        let hub = Hub::start();
        let (a, mut a_rx) = test_session("a", &["all"], Some("t1"), None);
        hub.register(a);
        wait_for_sessions(&hub, 1).await;

        hub.broadcast_to_tenant("t1", "dvr_progress", "dvr", json!({}));
        assert!(recv_one(&mut a_rx).await.is_some());

        // Infrastructure still requires an explicit "system" subscription.
        hub.broadcast_infrastructure("node_lifecycle", json!({}));
        assert!(recv_one(&mut a_rx).await.is_none());
    }

    #[tokio::test]
    async fn user_scoped_messages_narrow_to_matching_session() {
        let hub = Hub::start();
        let (viewer, mut viewer_rx) =
            test_session("viewer", &["viewers"], Some("t1"), Some("sess-9"));
        let (other, mut other_rx) =
            test_session("other", &["viewers"], Some("t1"), Some("sess-1"));
        hub.register(viewer);
        hub.register(other);
        wait_for_sessions(&hub, 2).await;

        hub.broadcast_to_tenant("t1", "viewer_join", "viewers", json!({"session_id": "sess-9"}));
        assert!(recv_one(&mut viewer_rx).await.is_some());
        assert!(recv_one(&mut other_rx).await.is_none());
    }

    #[tokio::test]
    async fn full_queue_evicts_the_session() {
        let hub = Hub::start();
        let (tx, rx) = mpsc::channel(2); // tiny queue to fill fast
        hub.register(SessionHandle {
            session_id: "slow".to_owned(),
            queue: tx,
            subscribed_channels: ["streams".to_owned()].into_iter().collect(),
            user_id: None,
            tenant_id: Some("t1".to_owned()),
        });
        wait_for_sessions(&hub, 1).await;

        // Never drained: the third delivery would block, so the session goes.
        for i in 0..3 {
            hub.broadcast_to_tenant("t1", "stream_lifecycle", "streams", json!({"i": i}));
        }
        wait_for_sessions(&hub, 0).await;
        drop(rx);
    }

    #[tokio::test]
    async fn subscription_control_updates_routing() {
        let hub = Hub::start();
        let (session, mut rx) = test_session("s", &["streams"], Some("t1"), None);
        hub.register(session);
        wait_for_sessions(&hub, 1).await;

        hub.broadcast_to_tenant("t1", "dvr_progress", "dvr", json!({}));
        assert!(recv_one(&mut rx).await.is_none(), "not yet subscribed to dvr");

        hub.subscribe("s", vec!["dvr".to_owned()], None, None);
        hub.broadcast_to_tenant("t1", "dvr_progress", "dvr", json!({}));
        assert!(recv_one(&mut rx).await.is_some());

        hub.unsubscribe("s", vec!["dvr".to_owned()]);
        hub.broadcast_to_tenant("t1", "dvr_progress", "dvr", json!({}));
        assert!(recv_one(&mut rx).await.is_none());
    }
}
