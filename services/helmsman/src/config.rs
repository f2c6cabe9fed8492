//! Helmsman configuration loading.
//!
//! TOML is the sole config source. Default config path:
//! `/etc/helmsman/helmsman.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `node.id`
//! - `orchestrator.address`
//! - `mist.url`
//! - `auth.service_token_file`
//! - `edge.public_url`
//!
//! # Token file format
//! Raw token string on a single line; trimmed on read.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level helmsman configuration.
#[derive(Debug, Clone)]
pub struct HelmsmanConfig {
    pub schema_version: u32,
    pub node: NodeConfig,
    pub orchestrator: OrchestratorConfig,
    pub mist: MistConfig,
    /// The service token (read from the token file, not the file path).
    pub service_token: String,
    pub edge: EdgeConfig,
    pub storage: StorageConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    pub roles: Vec<String>,
    pub cap_ingest: bool,
    pub cap_edge: bool,
    pub cap_storage: bool,
    pub cap_processing: bool,
    /// Explicit override; None means derive from hostname + node id.
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// WebSocket URL of the control endpoint, e.g. `wss://foghorn.example/ws/control`.
    pub address: String,
    pub enrollment_token: Option<String>,
    /// How long a blocking trigger waits for reconnection before retrying.
    pub blocking_grace_ms: u64,
    pub requested_mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MistConfig {
    /// Base URL of the MistServer HTTP admin API.
    pub url: String,
    pub api_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Public URL viewers reach this edge on; feeds output pubaddr/pubhost.
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: String,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub bind: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    node: Option<RawNodeConfig>,
    orchestrator: Option<RawOrchestratorConfig>,
    mist: Option<RawMistConfig>,
    auth: Option<RawAuthConfig>,
    edge: Option<RawEdgeConfig>,
    storage: Option<RawStorageConfig>,
    webhook: Option<RawWebhookConfig>,
}

#[derive(Debug, Deserialize)]
struct RawNodeConfig {
    id: Option<String>,
    roles: Option<Vec<String>>,
    cap_ingest: Option<bool>,
    cap_edge: Option<bool>,
    cap_storage: Option<bool>,
    cap_processing: Option<bool>,
    fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOrchestratorConfig {
    address: Option<String>,
    enrollment_token: Option<String>,
    blocking_grace_ms: Option<u64>,
    requested_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMistConfig {
    url: Option<String>,
    api_password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    service_token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEdgeConfig {
    public_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStorageConfig {
    root: Option<String>,
    bucket: Option<String>,
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWebhookConfig {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<HelmsmanConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/helmsman/helmsman.toml`.
pub fn load_config() -> Result<HelmsmanConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/helmsman/helmsman.toml"))
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<HelmsmanConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let raw_node = raw
        .node
        .ok_or_else(|| ConfigError::MissingField("node".to_owned()))?;
    let node = NodeConfig {
        id: raw_node
            .id
            .ok_or_else(|| ConfigError::MissingField("node.id".to_owned()))?,
        roles: raw_node.roles.unwrap_or_else(|| vec!["edge".to_owned()]),
        cap_ingest: raw_node.cap_ingest.unwrap_or(true),
        cap_edge: raw_node.cap_edge.unwrap_or(true),
        cap_storage: raw_node.cap_storage.unwrap_or(true),
        cap_processing: raw_node.cap_processing.unwrap_or(false),
        fingerprint: raw_node.fingerprint,
    };

    let raw_orch = raw
        .orchestrator
        .ok_or_else(|| ConfigError::MissingField("orchestrator".to_owned()))?;
    let orchestrator = OrchestratorConfig {
        address: raw_orch
            .address
            .ok_or_else(|| ConfigError::MissingField("orchestrator.address".to_owned()))?,
        enrollment_token: raw_orch.enrollment_token,
        blocking_grace_ms: raw_orch.blocking_grace_ms.unwrap_or(2000),
        requested_mode: raw_orch.requested_mode,
    };

    let raw_mist = raw
        .mist
        .ok_or_else(|| ConfigError::MissingField("mist".to_owned()))?;
    let mist = MistConfig {
        url: raw_mist
            .url
            .ok_or_else(|| ConfigError::MissingField("mist.url".to_owned()))?,
        api_password: raw_mist.api_password,
    };

    let raw_auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let token_file = raw_auth
        .service_token_file
        .ok_or_else(|| ConfigError::MissingField("auth.service_token_file".to_owned()))?;
    let service_token = read_token_file(&token_file)?;

    let raw_edge = raw
        .edge
        .ok_or_else(|| ConfigError::MissingField("edge".to_owned()))?;
    let edge = EdgeConfig {
        public_url: raw_edge
            .public_url
            .ok_or_else(|| ConfigError::MissingField("edge.public_url".to_owned()))?,
    };

    let storage = match raw.storage {
        Some(s) => StorageConfig {
            root: s.root.unwrap_or_else(|| "/var/lib/helmsman".to_owned()),
            bucket: s.bucket,
            prefix: s.prefix,
        },
        None => StorageConfig {
            root: "/var/lib/helmsman".to_owned(),
            bucket: None,
            prefix: None,
        },
    };

    let webhook = match raw.webhook {
        Some(w) => WebhookConfig {
            bind: w.bind.unwrap_or_else(|| "0.0.0.0:8090".to_owned()),
        },
        None => WebhookConfig {
            bind: "0.0.0.0:8090".to_owned(),
        },
    };

    Ok(HelmsmanConfig {
        schema_version,
        node,
        orchestrator,
        mist,
        service_token,
        edge,
        storage,
        webhook,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Token file reader
// ---------------------------------------------------------------------------

fn read_token_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading token file '{}': {}", path, e)))?;
    Ok(content.trim().to_owned())
}
