//! Pending request registry.
//!
//! Correlates request IDs to one-shot response channels. Entries are
//! inserted before the request is framed, and removed on response,
//! disconnect, or deadline — the map never outlives its connection's
//! in-flight requests.

use helm_protocol::ControlPayload;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Map of in-flight request IDs awaiting a response payload.
///
/// The lock is held only for insert/remove/complete; response delivery is a
/// non-blocking send on the one-shot.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, oneshot::Sender<ControlPayload>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request ID and return the receiver the caller awaits.
    ///
    /// Request IDs are freshly-generated UUIDs, so collisions do not occur;
    /// if one did, the older entry is dropped and its waiter wakes with a
    /// closed channel.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<ControlPayload> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("pending map lock poisoned")
            .insert(request_id.to_owned(), tx);
        rx
    }

    /// Deliver a response to the waiter, if still registered.
    ///
    /// Returns false when no entry exists (late or unsolicited response).
    pub fn complete(&self, request_id: &str, payload: ControlPayload) -> bool {
        let tx = self
            .inner
            .lock()
            .expect("pending map lock poisoned")
            .remove(request_id);
        match tx {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// De-register without delivering (caller gave up).
    pub fn remove(&self, request_id: &str) -> bool {
        self.inner
            .lock()
            .expect("pending map lock poisoned")
            .remove(request_id)
            .is_some()
    }

    /// Drop every entry. Waiters observe a closed channel immediately.
    ///
    /// Called on disconnect so no request outlives its connection.
    pub fn fail_all(&self) {
        self.inner.lock().expect("pending map lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_protocol::{Heartbeat, MistTriggerResponse, TriggerErrorCode};

    fn response(request_id: &str) -> ControlPayload {
        ControlPayload::MistTriggerResponse(MistTriggerResponse {
            request_id: request_id.to_owned(),
            response: "ok".to_owned(),
            abort: false,
            error_code: TriggerErrorCode::Unspecified,
        })
    }

    #[tokio::test]
    async fn complete_delivers_exactly_once() {
        let pending = PendingRequests::new();
        let rx = pending.register("r1");

        assert!(pending.complete("r1", response("r1")));
        assert!(matches!(
            rx.await.unwrap(),
            ControlPayload::MistTriggerResponse(_)
        ));

        // Second completion finds no entry.
        assert!(!pending.complete("r1", response("r1")));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unknown_request_id_is_rejected() {
        let pending = PendingRequests::new();
        assert!(!pending.complete(
            "never-registered",
            ControlPayload::Heartbeat(Heartbeat {
                node_id: "n".to_owned()
            })
        ));
    }

    #[tokio::test]
    async fn fail_all_wakes_every_waiter_with_closed_channel() {
        let pending = PendingRequests::new();
        let rx1 = pending.register("r1");
        let rx2 = pending.register("r2");
        assert_eq!(pending.len(), 2);

        pending.fail_all();
        assert!(pending.is_empty());
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }

    #[tokio::test]
    async fn remove_prevents_later_delivery() {
        let pending = PendingRequests::new();
        let rx = pending.register("r1");
        assert!(pending.remove("r1"));
        assert!(!pending.complete("r1", response("r1")));
        assert!(rx.await.is_err());
    }
}
