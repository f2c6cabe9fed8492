//! Typed triggers emitted by the upstream video server.
//!
//! A single trigger type feeds both ingestion paths: webhook bodies are
//! parsed into these variants by the edge, and the same variants travel on
//! the control stream to the orchestrator. Blocking triggers require a
//! [`crate::MistTriggerResponse`] within a deadline; non-blocking triggers
//! are fire-and-forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Trigger type enum
// ---------------------------------------------------------------------------

/// Wire names match the upstream video server's trigger names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// Incoming push URL rewrite (may deny or redirect an ingest).
    PushRewrite,
    /// Playback request for a stream that does not exist locally.
    DefaultStream,
    /// Source resolution for a configured stream.
    StreamSource,
    /// An outgoing push is about to start.
    PushOutStart,
    /// An outgoing push ended.
    PushEnd,
    /// A viewer session connected.
    UserNew,
    /// A viewer session ended.
    UserEnd,
    /// Stream buffer state changed (carries embedded track details).
    StreamBuffer,
    /// A stream fully shut down.
    StreamEnd,
    /// The live track list changed.
    LiveTrackList,
    /// A recording finished.
    RecordingEnd,
    /// A recording sealed one more segment.
    RecordingSegment,
}

impl TriggerType {
    /// Blocking triggers hold the webhook reply open until the orchestrator
    /// answers (or the deadline fires). Everything else returns 200
    /// immediately after enqueue.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            TriggerType::PushRewrite
                | TriggerType::DefaultStream
                | TriggerType::StreamSource
                | TriggerType::PushOutStart
                | TriggerType::UserNew
        )
    }

    /// The path segment under `/webhooks/mist/` for this trigger.
    pub fn webhook_name(self) -> &'static str {
        match self {
            TriggerType::PushRewrite => "PUSH_REWRITE",
            TriggerType::DefaultStream => "DEFAULT_STREAM",
            TriggerType::StreamSource => "STREAM_SOURCE",
            TriggerType::PushOutStart => "PUSH_OUT_START",
            TriggerType::PushEnd => "PUSH_END",
            TriggerType::UserNew => "USER_NEW",
            TriggerType::UserEnd => "USER_END",
            TriggerType::StreamBuffer => "STREAM_BUFFER",
            TriggerType::StreamEnd => "STREAM_END",
            TriggerType::LiveTrackList => "LIVE_TRACK_LIST",
            TriggerType::RecordingEnd => "RECORDING_END",
            TriggerType::RecordingSegment => "RECORDING_SEGMENT",
        }
    }

    /// Inverse of [`TriggerType::webhook_name`].
    pub fn from_webhook_name(name: &str) -> Option<Self> {
        match name {
            "PUSH_REWRITE" => Some(TriggerType::PushRewrite),
            "DEFAULT_STREAM" => Some(TriggerType::DefaultStream),
            "STREAM_SOURCE" => Some(TriggerType::StreamSource),
            "PUSH_OUT_START" => Some(TriggerType::PushOutStart),
            "PUSH_END" => Some(TriggerType::PushEnd),
            "USER_NEW" => Some(TriggerType::UserNew),
            "USER_END" => Some(TriggerType::UserEnd),
            "STREAM_BUFFER" => Some(TriggerType::StreamBuffer),
            "STREAM_END" => Some(TriggerType::StreamEnd),
            "LIVE_TRACK_LIST" => Some(TriggerType::LiveTrackList),
            "RECORDING_END" => Some(TriggerType::RecordingEnd),
            "RECORDING_SEGMENT" => Some(TriggerType::RecordingSegment),
        _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger envelope
// ---------------------------------------------------------------------------

/// A typed trigger event, as sent on the control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MistTrigger {
    pub trigger_type: TriggerType,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub blocking: bool,
    pub request_id: String,
    pub payload: TriggerPayload,
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// One-of payloads, discriminated by a `type` tag mirroring the trigger
/// type in snake case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum TriggerPayload {
    PushRewrite(PushRewritePayload),
    DefaultStream(DefaultStreamPayload),
    StreamSource(StreamSourcePayload),
    PushOutStart(PushOutStartPayload),
    PushEnd(PushEndPayload),
    UserNew(UserNewPayload),
    UserEnd(UserEndPayload),
    StreamBuffer(StreamBufferPayload),
    StreamEnd(StreamEndPayload),
    LiveTrackList(LiveTrackListPayload),
    RecordingEnd(RecordingEndPayload),
    RecordingSegment(RecordingSegmentPayload),
}

impl TriggerPayload {
    /// The viewer session id for user-scoped payloads, if present.
    ///
    /// The fan-out hub uses this to narrow delivery of viewer events to the
    /// session they concern.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            TriggerPayload::UserNew(p) => Some(&p.session_id),
            TriggerPayload::UserEnd(p) => Some(&p.session_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRewritePayload {
    pub push_url: String,
    pub hostname: String,
    pub stream_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultStreamPayload {
    pub default_stream: String,
    pub requested_url: String,
    pub viewer_host: String,
    #[serde(default)]
    pub output_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSourcePayload {
    pub stream_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutStartPayload {
    pub stream_name: String,
    pub target_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEndPayload {
    pub push_id: String,
    pub stream_name: String,
    pub target_uri: String,
    /// Raw log lines from the push; inspected for failure markers.
    #[serde(default)]
    pub log: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNewPayload {
    pub stream_name: String,
    pub connection_address: String,
    pub connection_id: String,
    pub protocol: String,
    pub request_url: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEndPayload {
    pub session_id: String,
    pub stream_name: String,
    pub connection_address: String,
    pub duration_seconds: u64,
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamBufferPayload {
    pub stream_name: String,
    /// FULL, EMPTY, DRY or RECOVER.
    pub buffer_state: String,
    /// Embedded JSON track detail as emitted by the video server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEndPayload {
    pub stream_name: String,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub total_viewers: u64,
    pub total_inputs: u64,
    pub total_outputs: u64,
    pub viewer_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTrackListPayload {
    pub stream_name: String,
    pub track_list: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingEndPayload {
    pub stream_name: String,
    pub target_uri: String,
    pub media_type: String,
    pub bytes_recorded: u64,
    pub seconds_spent: u64,
    pub unix_time_started: i64,
    pub unix_time_ended: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSegmentPayload {
    pub stream_name: String,
    pub segment_path: String,
    #[serde(default)]
    pub duration_seconds: f64,
}
