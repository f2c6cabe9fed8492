//! Signalman configuration loading.
//!
//! TOML is the sole config source. Default config path:
//! `/etc/signalman/signalman.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `kafka.brokers`
//! - `auth.service_token_file`

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct SignalmanConfig {
    pub schema_version: u32,
    pub bind: String,
    pub service_token: String,
    pub kafka: KafkaConfig,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub dlq_topic: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    bind: Option<String>,
    auth: Option<RawAuthConfig>,
    kafka: Option<RawKafkaConfig>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    service_token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawKafkaConfig {
    brokers: Option<String>,
    group_id: Option<String>,
    topics: Option<Vec<String>>,
    dlq_topic: Option<String>,
}

pub fn load_config_from_path(path: &Path) -> Result<SignalmanConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<SignalmanConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/signalman/signalman.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<SignalmanConfig, ConfigError> {
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

    let raw_auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let token_file = raw_auth
        .service_token_file
        .ok_or_else(|| ConfigError::MissingField("auth.service_token_file".to_owned()))?;
    let service_token = std::fs::read_to_string(&token_file)
        .map_err(|e| ConfigError::Io(format!("reading token file '{}': {}", token_file, e)))?
        .trim()
        .to_owned();

    let raw_kafka = raw
        .kafka
        .ok_or_else(|| ConfigError::MissingField("kafka".to_owned()))?;
    let kafka = KafkaConfig {
        brokers: raw_kafka
            .brokers
            .ok_or_else(|| ConfigError::MissingField("kafka.brokers".to_owned()))?,
        group_id: raw_kafka
            .group_id
            .unwrap_or_else(|| "signalman".to_owned()),
        topics: raw_kafka
            .topics
            .unwrap_or_else(|| vec!["platform-events".to_owned()]),
        dlq_topic: raw_kafka
            .dlq_topic
            .unwrap_or_else(|| "platform-events-dlq".to_owned()),
    };

    Ok(SignalmanConfig {
        schema_version,
        bind: raw.bind.unwrap_or_else(|| "0.0.0.0:8085".to_owned()),
        service_token,
        kafka,
    })
}

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
