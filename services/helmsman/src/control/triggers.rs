//! Trigger dispatch toward the orchestrator.
//!
//! Non-blocking triggers are fire-and-forget: enqueued for send, no
//! response awaited. Blocking triggers retry across reconnects inside a
//! total deadline and always produce an outcome the webhook layer can
//! translate into an HTTP reply.

use super::transport::ControlStream;
use super::IngestError;
use helm_protocol::{ControlPayload, MistTrigger, TriggerErrorCode};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const BLOCKING_TRIGGER_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a trigger caller observes.
///
/// For non-blocking triggers only `Ok`/`Err` of the send matters and the
/// outcome carries an empty response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub response: String,
    pub abort: bool,
    pub error_code: TriggerErrorCode,
}

impl TriggerOutcome {
    fn enqueued() -> Self {
        TriggerOutcome {
            response: String::new(),
            abort: false,
            error_code: TriggerErrorCode::Unspecified,
        }
    }

    fn timed_out() -> Self {
        TriggerOutcome {
            response: String::new(),
            abort: true,
            error_code: TriggerErrorCode::Timeout,
        }
    }

    fn internal() -> Self {
        TriggerOutcome {
            response: String::new(),
            abort: true,
            error_code: TriggerErrorCode::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes triggers onto the control stream and correlates blocking
/// responses back to the caller.
#[derive(Clone)]
pub struct TriggerDispatcher {
    stream: ControlStream,
    /// How long a blocking trigger waits for reconnection per attempt.
    reconnect_grace: Duration,
}

impl TriggerDispatcher {
    pub fn new(stream: ControlStream, reconnect_grace_ms: u64) -> Self {
        TriggerDispatcher {
            stream,
            reconnect_grace: Duration::from_millis(reconnect_grace_ms),
        }
    }

    /// Send a trigger to the orchestrator.
    ///
    /// Blocking triggers retry up to 3 attempts within a 5 s total
    /// deadline, waking immediately on disconnect and re-sending once the
    /// stream is back. Exhaustion yields `{ abort: true, Internal }`;
    /// deadline yields `{ abort: true, Timeout }`.
    pub async fn send_mist_trigger(
        &self,
        trigger: MistTrigger,
    ) -> Result<TriggerOutcome, IngestError> {
        if !trigger.blocking {
            self.stream
                .send(ControlPayload::MistTrigger(trigger))
                .await?;
            return Ok(TriggerOutcome::enqueued());
        }

        let deadline = Instant::now() + BLOCKING_TRIGGER_TIMEOUT;
        for attempt in 1..=MAX_ATTEMPTS {
            if Instant::now() >= deadline {
                return Ok(TriggerOutcome::timed_out());
            }
            match self.blocking_attempt(&trigger, deadline).await {
                AttemptResult::Response(outcome) => return Ok(outcome),
                AttemptResult::DeadlineExceeded => return Ok(TriggerOutcome::timed_out()),
                AttemptResult::Retry => {
                    debug!(
                        request_id = %trigger.request_id,
                        attempt,
                        "blocking trigger attempt failed, retrying"
                    );
                }
            }
        }

        warn!(request_id = %trigger.request_id, "blocking trigger attempts exhausted");
        Ok(TriggerOutcome::internal())
    }

    async fn blocking_attempt(&self, trigger: &MistTrigger, deadline: Instant) -> AttemptResult {
        // Wait for a stream, bounded by the grace period and the deadline.
        if !self.stream.is_connected() {
            let grace_deadline = Instant::now() + self.reconnect_grace;
            let wait_until = grace_deadline.min(deadline);
            let mut connected = self.stream.connected_watch();
            let waited = tokio::time::timeout_at(
                wait_until,
                connected.wait_for(|up| *up),
            )
            .await;
            match waited {
                Ok(Ok(_)) => {}
                // Watch closed: runner is gone, nothing to wait for.
                Ok(Err(_)) => return AttemptResult::Retry,
                Err(_) if Instant::now() >= deadline => return AttemptResult::DeadlineExceeded,
                Err(_) => return AttemptResult::Retry,
            }
        }

        // Snapshot the disconnect signal before sending so a disconnect
        // racing the send still wakes us.
        let mut disconnects = self.stream.disconnects();
        disconnects.borrow_and_update();

        let rx = self.stream.pending().register(&trigger.request_id);
        if self
            .stream
            .send(ControlPayload::MistTrigger(trigger.clone()))
            .await
            .is_err()
        {
            self.stream.pending().remove(&trigger.request_id);
            return AttemptResult::Retry;
        }

        tokio::select! {
            response = rx => match response {
                Ok(ControlPayload::MistTriggerResponse(r)) => {
                    AttemptResult::Response(TriggerOutcome {
                        response: r.response,
                        abort: r.abort,
                        error_code: r.error_code,
                    })
                }
                // Wrong payload kind for our request id — protocol slip.
                Ok(other) => {
                    warn!(request_id = %trigger.request_id, payload = ?other,
                        "unexpected payload for blocking trigger");
                    AttemptResult::Retry
                }
                // Sender dropped: the pending map was failed on disconnect.
                Err(_) => AttemptResult::Retry,
            },
            _ = disconnects.changed() => {
                self.stream.pending().remove(&trigger.request_id);
                AttemptResult::Retry
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.stream.pending().remove(&trigger.request_id);
                AttemptResult::DeadlineExceeded
            }
        }
    }
}

enum AttemptResult {
    Response(TriggerOutcome),
    Retry,
    DeadlineExceeded,
}
