//! Webhook surface for upstream video-server triggers.
//!
//! One POST endpoint per trigger type at `/webhooks/mist/{name}`. Bodies
//! are newline-separated parameter lists (CRLF normalized); some triggers
//! carry an embedded JSON document. Blocking triggers hold the HTTP reply
//! until the orchestrator answers; `abort = true` surfaces as a
//! non-success status with the response text as body. Non-blocking
//! triggers return 200 immediately after enqueue.

use crate::control::transport::ControlStream;
use crate::control::triggers::TriggerDispatcher;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use helm_protocol::trigger::{
    DefaultStreamPayload, LiveTrackListPayload, PushEndPayload, PushOutStartPayload,
    PushRewritePayload, RecordingEndPayload, RecordingSegmentPayload, StreamBufferPayload,
    StreamEndPayload, StreamSourcePayload, UserEndPayload, UserNewPayload,
};
use helm_protocol::{MistTrigger, TriggerPayload, TriggerType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Capabilities the webhook layer needs, injected at wiring time.
#[derive(Clone)]
pub struct WebhookState {
    pub dispatcher: TriggerDispatcher,
    pub control: ControlStream,
    /// Invoked with the segment path of each RECORDING_SEGMENT trigger so
    /// the DVR manager can sync opportunistically.
    pub segment_hook: Arc<dyn Fn(String) + Send + Sync>,
    pub ready: Arc<AtomicBool>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/mist/{name}", post(handle_trigger))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<WebhookState>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

// ---------------------------------------------------------------------------
// Trigger handler
// ---------------------------------------------------------------------------

async fn handle_trigger(
    Path(name): Path<String>,
    State(state): State<WebhookState>,
    body: String,
) -> (StatusCode, String) {
    let Some(trigger_type) = TriggerType::from_webhook_name(&name) else {
        return (StatusCode::NOT_FOUND, format!("unknown trigger: {name}"));
    };

    let payload = match parse_trigger_payload(trigger_type, &body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(trigger = %name, error = %e, "unparseable trigger body");
            return (StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    if let TriggerPayload::RecordingSegment(segment) = &payload {
        (state.segment_hook)(segment.segment_path.clone());
    }

    let trigger = MistTrigger {
        trigger_type,
        node_id: state.control.current_node_id(),
        timestamp: Utc::now(),
        blocking: trigger_type.is_blocking(),
        request_id: Uuid::new_v4().to_string(),
        payload,
    };

    if !trigger.blocking {
        if let Err(e) = state.dispatcher.send_mist_trigger(trigger).await {
            debug!(trigger = %name, error = %e, "non-blocking trigger not enqueued");
        }
        return (StatusCode::OK, String::new());
    }

    match state.dispatcher.send_mist_trigger(trigger).await {
        Ok(outcome) if outcome.abort => (StatusCode::FORBIDDEN, outcome.response),
        Ok(outcome) => (StatusCode::OK, outcome.response),
        Err(e) => {
            warn!(trigger = %name, error = %e, "blocking trigger failed");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

// ---------------------------------------------------------------------------
// Body parsing
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing parameter {0} for {1}")]
    MissingParam(usize, &'static str),
}

/// Parse a newline-separated trigger body into its typed payload.
///
/// Numeric fields tolerate malformed input (defaulting to zero) — a
/// drifting upstream format must not turn into dropped events.
pub fn parse_trigger_payload(
    trigger_type: TriggerType,
    body: &str,
) -> Result<TriggerPayload, WebhookError> {
    let normalized = body.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.split('\n').map(str::trim_end).collect();
    let param = |index: usize| -> Option<&str> {
        lines.get(index).copied().filter(|l| !l.is_empty())
    };
    let required = |index: usize| -> Result<String, WebhookError> {
        param(index)
            .map(ToOwned::to_owned)
            .ok_or(WebhookError::MissingParam(index, trigger_type.webhook_name()))
    };
    let number = |index: usize| -> u64 { param(index).and_then(|v| v.parse().ok()).unwrap_or(0) };

    let payload = match trigger_type {
        TriggerType::PushRewrite => TriggerPayload::PushRewrite(PushRewritePayload {
            push_url: required(0)?,
            hostname: required(1)?,
            stream_name: required(2)?,
        }),
        TriggerType::DefaultStream => TriggerPayload::DefaultStream(DefaultStreamPayload {
            default_stream: required(0)?,
            requested_url: required(1)?,
            viewer_host: param(2).unwrap_or_default().to_owned(),
            output_type: param(3).unwrap_or_default().to_owned(),
        }),
        TriggerType::StreamSource => TriggerPayload::StreamSource(StreamSourcePayload {
            stream_name: required(0)?,
        }),
        TriggerType::PushOutStart => TriggerPayload::PushOutStart(PushOutStartPayload {
            stream_name: required(0)?,
            target_uri: required(1)?,
        }),
        TriggerType::PushEnd => TriggerPayload::PushEnd(PushEndPayload {
            push_id: required(0)?,
            stream_name: required(1)?,
            target_uri: param(2).unwrap_or_default().to_owned(),
            log: param(3)
                .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
                .unwrap_or_default(),
        }),
        TriggerType::UserNew => TriggerPayload::UserNew(UserNewPayload {
            stream_name: required(0)?,
            connection_address: required(1)?,
            connection_id: param(2).unwrap_or_default().to_owned(),
            protocol: param(3).unwrap_or_default().to_owned(),
            request_url: param(4).unwrap_or_default().to_owned(),
            session_id: required(5)?,
        }),
        TriggerType::UserEnd => TriggerPayload::UserEnd(UserEndPayload {
            session_id: required(0)?,
            stream_name: required(1)?,
            connection_address: param(2).unwrap_or_default().to_owned(),
            duration_seconds: number(3),
            uploaded_bytes: number(4),
            downloaded_bytes: number(5),
        }),
        TriggerType::StreamBuffer => TriggerPayload::StreamBuffer(StreamBufferPayload {
            stream_name: required(0)?,
            buffer_state: required(1)?,
            track_details: param(2).and_then(|raw| serde_json::from_str(raw).ok()),
        }),
        TriggerType::StreamEnd => TriggerPayload::StreamEnd(StreamEndPayload {
            stream_name: required(0)?,
            downloaded_bytes: number(1),
            uploaded_bytes: number(2),
            total_viewers: number(3),
            total_inputs: number(4),
            total_outputs: number(5),
            viewer_seconds: number(6),
        }),
        TriggerType::LiveTrackList => TriggerPayload::LiveTrackList(LiveTrackListPayload {
            stream_name: required(0)?,
            track_list: param(1)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(serde_json::Value::Null),
        }),
        TriggerType::RecordingEnd => TriggerPayload::RecordingEnd(RecordingEndPayload {
            stream_name: required(0)?,
            target_uri: required(1)?,
            media_type: param(2).unwrap_or_default().to_owned(),
            bytes_recorded: number(3),
            seconds_spent: number(4),
            unix_time_started: number(5) as i64,
            unix_time_ended: number(6) as i64,
        }),
        TriggerType::RecordingSegment => TriggerPayload::RecordingSegment(RecordingSegmentPayload {
            stream_name: required(0)?,
            segment_path: required(1)?,
            duration_seconds: param(2).and_then(|v| v.parse().ok()).unwrap_or(0.0),
        }),
    };
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rewrite_body_parses_positionally() {
        let body = "rtmp://x/live/s\r\n1.2.3.4\r\nlive+s";
        let payload = parse_trigger_payload(TriggerType::PushRewrite, body).unwrap();
        match payload {
            TriggerPayload::PushRewrite(p) => {
                assert_eq!(p.push_url, "rtmp://x/live/s");
                assert_eq!(p.hostname, "1.2.3.4");
                assert_eq!(p.stream_name, "live+s");
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn missing_required_param_is_an_error() {
        let err = parse_trigger_payload(TriggerType::PushRewrite, "rtmp://x\n1.2.3.4").unwrap_err();
        assert!(err.to_string().contains("PUSH_REWRITE"));
    }

    #[test]
    fn stream_buffer_carries_embedded_track_json() {
        let body = "live+s\nFULL\n{\"track1\":{\"codec\":\"H264\",\"width\":1920}}";
        let payload = parse_trigger_payload(TriggerType::StreamBuffer, body).unwrap();
        match payload {
            TriggerPayload::StreamBuffer(p) => {
                assert_eq!(p.buffer_state, "FULL");
                let details = p.track_details.unwrap();
                assert_eq!(details["track1"]["codec"], "H264");
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn stream_buffer_tolerates_missing_track_json() {
        let payload = parse_trigger_payload(TriggerType::StreamBuffer, "live+s\nEMPTY").unwrap();
        match payload {
            TriggerPayload::StreamBuffer(p) => assert!(p.track_details.is_none()),
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn user_end_numbers_default_to_zero_on_garbage() {
        let body = "sess-1\nlive+s\n1.2.3.4\nnot-a-number\n123\n";
        let payload = parse_trigger_payload(TriggerType::UserEnd, body).unwrap();
        match payload {
            TriggerPayload::UserEnd(p) => {
                assert_eq!(p.duration_seconds, 0);
                assert_eq!(p.uploaded_bytes, 123);
                assert_eq!(p.downloaded_bytes, 0);
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn push_end_log_parses_json_array() {
        let body = "17\nlive+s\npush://t\n[\"connected\",\"write error\"]";
        let payload = parse_trigger_payload(TriggerType::PushEnd, body).unwrap();
        match payload {
            TriggerPayload::PushEnd(p) => {
                assert_eq!(p.push_id, "17");
                assert_eq!(p.log, vec!["connected", "write error"]);
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn recording_segment_parses_duration() {
        let body = "live+s\n/data/dvr/s1/d1/segments/12_0.ts\n6.006";
        let payload = parse_trigger_payload(TriggerType::RecordingSegment, body).unwrap();
        match payload {
            TriggerPayload::RecordingSegment(p) => {
                assert_eq!(p.segment_path, "/data/dvr/s1/d1/segments/12_0.ts");
                assert!((p.duration_seconds - 6.006).abs() < 1e-9);
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }
}
