//! Hub message model and event-type classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The infrastructure channel. Messages without a tenant scope are only
/// ever delivered to sessions subscribed here.
pub const SYSTEM_CHANNEL: &str = "system";

/// Wildcard subscription matching any channel.
pub const ALL_CHANNELS: &str = "all";

// ---------------------------------------------------------------------------
// HubMessage
// ---------------------------------------------------------------------------

/// One fan-out message. Absence of `tenant_id` marks infrastructure scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub channel: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl HubMessage {
    pub fn tenant(
        tenant_id: impl Into<String>,
        message_type: impl Into<String>,
        channel: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        HubMessage {
            message_type: message_type.into(),
            channel: channel.into(),
            data,
            timestamp: Utc::now(),
            tenant_id: Some(tenant_id.into()),
        }
    }

    pub fn infrastructure(message_type: impl Into<String>, data: serde_json::Value) -> Self {
        HubMessage {
            message_type: message_type.into(),
            channel: SYSTEM_CHANNEL.to_owned(),
            data,
            timestamp: Utc::now(),
            tenant_id: None,
        }
    }

    /// Whether this message targets a single viewer session.
    pub fn is_user_scoped(&self) -> bool {
        matches!(self.message_type.as_str(), "viewer_join" | "viewer_leave")
    }

    /// The viewer session id for user-scoped messages, when extractable.
    pub fn target_session_id(&self) -> Option<&str> {
        if !self.is_user_scoped() {
            return None;
        }
        self.data.get("session_id").and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Map an ingested event type to its fan-out channel.
///
/// Unknown event types return `None` and are dropped by the consumer glue.
pub fn channel_for_event(event_type: &str) -> Option<&'static str> {
    let channel = match event_type {
        "stream_lifecycle" | "stream_buffer" | "stream_end" | "push_start" | "push_end"
        | "track_list" => "streams",
        "viewer_join" | "viewer_leave" | "viewer_stats" => "viewers",
        "dvr_started" | "dvr_progress" | "dvr_stopped" => "dvr",
        "clip_created" | "clip_synced" | "vod_synced" | "artifact_deleted" => "storage",
        "node_lifecycle" | "node_enrolled" | "node_offline" => SYSTEM_CHANNEL,
        _ => return None,
    };
    Some(channel)
}

// ---------------------------------------------------------------------------
// Subscription control (client -> hub)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// The only client-to-hub traffic: subscription control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionControl {
    pub action: SubscriptionAction,
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}
