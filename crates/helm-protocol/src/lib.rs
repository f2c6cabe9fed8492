// helm-protocol: Control-stream wire types shared by the edge sidecar and
// anything that speaks to the orchestrator on its behalf.
//
// All control messages use a top-level `kind` field for discriminated
// deserialization. The enum variants map 1:1 to the frozen message kinds.
// Direction is a property of the payload type, not the framing: both sides
// send `ControlMessage` envelopes on the same bidirectional stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod trigger;

pub use trigger::{MistTrigger, TriggerPayload, TriggerType};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The envelope every control-stream frame carries.
///
/// `sent_at` is stamped by the sender at serialization time and is advisory
/// (receivers never use it for ordering; the stream itself is ordered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub sent_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: ControlPayload,
}

impl ControlMessage {
    /// Wrap a payload with a fresh `sent_at` stamp.
    pub fn new(payload: ControlPayload) -> Self {
        ControlMessage {
            sent_at: Utc::now(),
            payload,
        }
    }
}

/// All control message kinds.
///
/// ```json
/// { "sent_at": "...", "kind": "heartbeat", "node_id": "..." }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ControlPayload {
    Register(Register),
    Heartbeat(Heartbeat),
    MistTrigger(MistTrigger),
    MistTriggerResponse(MistTriggerResponse),
    FreezePermissionRequest(FreezePermissionRequest),
    FreezePermissionResponse(FreezePermissionResponse),
    FreezeProgress(FreezeProgress),
    FreezeComplete(FreezeComplete),
    SyncComplete(SyncComplete),
    DefrostRequest(DefrostRequest),
    DefrostProgress(DefrostProgress),
    DefrostComplete(DefrostComplete),
    CanDeleteRequest(CanDeleteRequest),
    CanDeleteResponse(CanDeleteResponse),
    ArtifactDeleted(ArtifactDeleted),
    StorageLifecycle(StorageLifecycle),
    DvrStartRequest(DvrStartRequest),
    DvrStopRequest(DvrStopRequest),
    DvrProgress(DvrProgress),
    DvrStopped(DvrStopped),
    ConfigSeed(ConfigSeed),
    StopSessionsRequest(StopSessionsRequest),
    Error(ErrorMessage),
}

impl ControlPayload {
    /// The correlation id carried by response-type payloads, if any.
    ///
    /// Used by the pending-request registry to route a response to the
    /// caller that issued the matching request.
    pub fn response_request_id(&self) -> Option<&str> {
        match self {
            ControlPayload::MistTriggerResponse(r) => Some(&r.request_id),
            ControlPayload::FreezePermissionResponse(r) => Some(&r.request_id),
            ControlPayload::CanDeleteResponse(r) => Some(&r.request_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Edge -> Orchestrator: registration and liveness
// ---------------------------------------------------------------------------

/// First message on every (re)connect, before any other traffic.
///
/// Capability flags and detected hardware let the orchestrator decide what
/// work this node may be handed. `enrollment_token` is only set until the
/// node has been accepted once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub node_id: String,
    pub roles: Vec<String>,
    pub cap_ingest: bool,
    pub cap_edge: bool,
    pub cap_storage: bool,
    pub cap_processing: bool,
    pub storage_local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment_token: Option<String>,
    pub fingerprint: String,
    pub cpu_cores: u32,
    pub memory_gb: u64,
    pub disk_gb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_mode: Option<String>,
}

/// Sent every 30 seconds while the stream is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
}

// ---------------------------------------------------------------------------
// Trigger responses (orchestrator -> edge)
// ---------------------------------------------------------------------------

/// Error codes a trigger caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerErrorCode {
    #[default]
    Unspecified,
    Timeout,
    Internal,
}

/// Orchestrator answer to a blocking trigger.
///
/// `response` becomes the webhook reply body verbatim; `abort = true` is
/// surfaced to the upstream video server as a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MistTriggerResponse {
    pub request_id: String,
    pub response: String,
    pub abort: bool,
    #[serde(default)]
    pub error_code: TriggerErrorCode,
}

// ---------------------------------------------------------------------------
// Storage: freeze / defrost / eviction
// ---------------------------------------------------------------------------

/// What kind of artifact a storage operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Clip,
    Dvr,
    Vod,
    /// A single sealed segment of a still-recording DVR, synced incrementally.
    DvrSegment,
}

/// Edge asks permission (and presigned URLs) to upload an artifact.
///
/// `filenames` is the complete upload set in order: for DVRs the manifest
/// first, then segments in manifest order, then any `.dtsh` sidecars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezePermissionRequest {
    pub request_id: String,
    pub asset_type: AssetType,
    pub asset_hash: String,
    pub local_path: String,
    pub size_bytes: u64,
    pub filenames: Vec<String>,
    pub node_id: String,
}

/// Orchestrator reply: approval plus presigned PUT targets.
///
/// Single-file assets get `presigned_put_url`; multi-file assets get one
/// entry per filename in `segment_urls`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezePermissionResponse {
    pub request_id: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presigned_put_url: Option<String>,
    #[serde(default)]
    pub segment_urls: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeProgress {
    pub request_id: String,
    pub asset_hash: String,
    pub percent: u8,
    pub bytes_uploaded: u64,
}

/// Terminal event for a failed freeze. Exactly one of `FreezeComplete`
/// (failure) or `SyncComplete` (success) is emitted per freeze.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeComplete {
    pub request_id: String,
    pub asset_hash: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal event for a successful freeze ("replicate, don't delete").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncComplete {
    pub request_id: String,
    pub asset_hash: String,
    pub status: String,
    pub size_bytes: u64,
    pub dtsh_included: bool,
}

/// Orchestrator asks the edge to re-hydrate an artifact from cold storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefrostRequest {
    pub request_id: String,
    pub asset_type: AssetType,
    pub asset_hash: String,
    pub local_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presigned_get_url: Option<String>,
    #[serde(default)]
    pub segment_urls: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefrostProgress {
    pub request_id: String,
    pub asset_hash: String,
    pub percent: u8,
    pub bytes_downloaded: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefrostComplete {
    pub request_id: String,
    pub asset_hash: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Edge asks whether a local artifact may be evicted.
///
/// The orchestrator holds the authoritative sync state; the edge never
/// deletes an artifact it has not been told is safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanDeleteRequest {
    pub request_id: String,
    pub asset_hash: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanDeleteResponse {
    pub request_id: String,
    pub asset_hash: String,
    pub safe_to_delete: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub warm_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDeleted {
    pub asset_hash: String,
    pub asset_type: AssetType,
    pub reason: String,
    pub node_id: String,
}

/// States an artifact passes through, announced to the orchestrator so it
/// can reconcile its view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    SyncStarted,
    Synced,
    Evicted,
    CacheStarted,
    Cached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLifecycle {
    pub asset_hash: String,
    pub asset_type: AssetType,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_duration_ms: Option<u64>,
    pub node_id: String,
}

// ---------------------------------------------------------------------------
// DVR recording sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvrStartRequest {
    pub dvr_hash: String,
    pub stream_id: String,
    pub internal_name: String,
    pub source_url: String,
    /// 0 means the default rolling window (7200 s).
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default)]
    pub segment_duration_seconds: u32,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvrStopRequest {
    pub dvr_hash: String,
    /// Becomes `DvrStopped.status`, e.g. "stopped" or "deleted".
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvrProgress {
    pub dvr_hash: String,
    pub status: String,
    pub segment_count: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvrStopped {
    pub dvr_hash: String,
    pub status: String,
    pub manifest_path: String,
    pub duration_seconds: u64,
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Orchestrator -> Edge: desired configuration
// ---------------------------------------------------------------------------

/// One stream template the edge must materialize on the video server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTemplate {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub gateway_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
}

/// Authoritative desired upstream-server configuration.
///
/// The edge adopts `node_id` from the seed for all subsequent messages;
/// until the first seed arrives it uses its configured identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSeed {
    pub node_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location_name: String,
    #[serde(default)]
    pub templates: Vec<StreamTemplate>,
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub operational_mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSessionsRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub stream_names: Vec<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Frozen error codes.
pub mod error_codes {
    pub const ENROLLMENT_REQUIRED: &str = "ENROLLMENT_REQUIRED";
    pub const ENROLLMENT_FAILED: &str = "ENROLLMENT_FAILED";
    pub const ENROLLMENT_UNAVAILABLE: &str = "ENROLLMENT_UNAVAILABLE";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

    /// Enrollment errors are fatal for the current connection attempt and
    /// force the transport back into backoff.
    pub fn is_enrollment(code: &str) -> bool {
        matches!(
            code,
            ENROLLMENT_REQUIRED | ENROLLMENT_FAILED | ENROLLMENT_UNAVAILABLE
        )
    }
}

/// Protocol error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// One of the frozen error codes.
    pub code: String,
    pub message: String,
    pub retryable: bool,
}
