//! MistServer HTTP admin API client.
//!
//! The upstream video server is an external collaborator; we only consume
//! its JSON admin API. Components depend on the [`MistApi`] trait so tests
//! can substitute a fake without a running server.
//!
//! Idempotent calls retry up to 3 times with exponential backoff; mutating
//! non-idempotent calls surface the first error.

use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const API_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MistError {
    #[error("HTTP: {0}")]
    Http(String),
    #[error("API rejected request: {0}")]
    Api(String),
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

// ---------------------------------------------------------------------------
// Push listing
// ---------------------------------------------------------------------------

/// One active push as reported by `push_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEntry {
    pub id: u64,
    pub stream: String,
    pub target: String,
    /// Raw log lines; inspected for "error"/"failed" markers.
    pub logs: Vec<String>,
}

impl PushEntry {
    /// Whether this entry's log lines contain a failure marker.
    pub fn looks_failed(&self) -> bool {
        self.logs.iter().any(|line| {
            let lower = line.to_lowercase();
            lower.contains("error") || lower.contains("failed")
        })
    }
}

/// Parse the `push_list` response: an array of
/// `[id, stream, original_target, effective_target, logs?]` rows.
pub fn parse_push_list(value: &Value) -> Result<Vec<PushEntry>, MistError> {
    let rows = value
        .as_array()
        .ok_or_else(|| MistError::Shape("push_list is not an array".to_owned()))?;
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = row
            .as_array()
            .ok_or_else(|| MistError::Shape("push_list row is not an array".to_owned()))?;
        let id = fields
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| MistError::Shape("push id missing".to_owned()))?;
        let stream = fields
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let target = fields
            .get(3)
            .and_then(Value::as_str)
            .or_else(|| fields.get(2).and_then(Value::as_str))
            .unwrap_or_default()
            .to_owned();
        let logs = fields
            .get(4)
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| l.as_str().map(ToOwned::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        entries.push(PushEntry {
            id,
            stream,
            target,
            logs,
        });
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// MistApi trait
// ---------------------------------------------------------------------------

/// The slice of the admin API this sidecar consumes.
pub trait MistApi: Send + Sync + 'static {
    fn start_push(
        &self,
        stream: &str,
        target: &str,
    ) -> impl Future<Output = Result<(), MistError>> + Send;

    fn stop_push(&self, push_id: u64) -> impl Future<Output = Result<(), MistError>> + Send;

    fn list_pushes(&self) -> impl Future<Output = Result<Vec<PushEntry>, MistError>> + Send;

    /// Full config document, as returned by `config_backup`.
    fn config_backup(&self) -> impl Future<Output = Result<Value, MistError>> + Send;

    /// Apply a partial config document (merged server-side).
    fn apply_config(&self, partial: Value) -> impl Future<Output = Result<(), MistError>> + Send;

    /// Disconnect all viewer/ingest sessions of the named streams.
    fn stop_sessions(
        &self,
        stream_names: &[String],
    ) -> impl Future<Output = Result<(), MistError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Production client for a local MistServer instance.
#[derive(Clone)]
pub struct MistHttp {
    client: reqwest::Client,
    base_url: String,
    api_password: Option<String>,
}

impl MistHttp {
    pub fn new(base_url: impl Into<String>, api_password: Option<String>) -> Self {
        MistHttp {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_password,
        }
    }

    /// POST one command document to the admin API and return the response
    /// body. Retries transport failures for idempotent commands.
    async fn command(&self, body: Value, idempotent: bool) -> Result<Value, MistError> {
        let url = format!("{}/api2", self.base_url.trim_end_matches('/'));
        let mut body = body;
        if let Some(password) = &self.api_password {
            body["authorize"] = json!({ "password": password });
        }

        let attempts = if idempotent { API_RETRIES } else { 1 };
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Value>()
                        .await
                        .map_err(|e| MistError::Shape(e.to_string()));
                }
                Ok(resp) => {
                    // Non-2xx is an API-level rejection; retrying will not help.
                    return Err(MistError::Api(format!("status {}", resp.status())));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "mist admin call failed");
                    last_err = Some(MistError::Http(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MistError::Http("no attempts made".to_owned())))
    }
}

impl MistApi for MistHttp {
    async fn start_push(&self, stream: &str, target: &str) -> Result<(), MistError> {
        debug!(stream = %stream, target = %target, "starting push");
        self.command(json!({ "push_start": { "stream": stream, "target": target } }), false)
            .await?;
        Ok(())
    }

    async fn stop_push(&self, push_id: u64) -> Result<(), MistError> {
        self.command(json!({ "push_stop": [push_id] }), true).await?;
        Ok(())
    }

    async fn list_pushes(&self) -> Result<Vec<PushEntry>, MistError> {
        let response = self.command(json!({ "push_list": true }), true).await?;
        let list = response.get("push_list").unwrap_or(&Value::Null);
        if list.is_null() {
            return Ok(Vec::new());
        }
        parse_push_list(list)
    }

    async fn config_backup(&self) -> Result<Value, MistError> {
        let response = self.command(json!({ "config_backup": true }), true).await?;
        response
            .get("config_backup")
            .cloned()
            .ok_or_else(|| MistError::Shape("config_backup missing".to_owned()))
    }

    async fn apply_config(&self, partial: Value) -> Result<(), MistError> {
        self.command(json!({ "config_restore": partial }), true)
            .await?;
        Ok(())
    }

    async fn stop_sessions(&self, stream_names: &[String]) -> Result<(), MistError> {
        self.command(json!({ "stop_sessions": stream_names }), true)
            .await?;
        Ok(())
    }
}
