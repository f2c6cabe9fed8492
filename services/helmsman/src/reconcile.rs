//! Config-seed reconciler.
//!
//! Applies the orchestrator's desired configuration to the upstream video
//! server idempotently. A SHA-256 of a stable projection of the seed is
//! kept as `last_applied_signature`; a matching signature still runs the
//! apply steps (they are cheap and tolerate drift) but is not logged as a
//! change. Every step is a no-op when the server already matches.

use crate::mist::{MistApi, MistError};
use helm_protocol::{ConfigSeed, TriggerType};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use tracing::{debug, info};

/// Essential output connectors every edge must expose.
const ESSENTIAL_OUTPUTS: [&str; 4] = ["HTTP", "WebRTC", "DTSC", "WSRaw"];

/// Minimum input resolution for the gateway ABR ladder.
const ABR_MIN_WIDTH: u32 = 850;
const ABR_MIN_HEIGHT: u32 = 480;

pub struct ConfigReconciler<M: MistApi> {
    mist: std::sync::Arc<M>,
    edge_public_url: String,
    /// Local webhook base, e.g. `http://127.0.0.1:8090/webhooks/mist`.
    webhook_base: String,
    /// Load-balancer source for template streams.
    balance_url: String,
    last_applied_signature: Mutex<Option<String>>,
}

impl<M: MistApi> ConfigReconciler<M> {
    pub fn new(
        mist: std::sync::Arc<M>,
        edge_public_url: impl Into<String>,
        webhook_base: impl Into<String>,
        balance_url: impl Into<String>,
    ) -> Self {
        ConfigReconciler {
            mist,
            edge_public_url: edge_public_url.into(),
            webhook_base: webhook_base.into(),
            balance_url: balance_url.into(),
            last_applied_signature: Mutex::new(None),
        }
    }

    /// Stable projection hash used to skip change-logging on no-op seeds.
    pub fn signature(seed: &ConfigSeed) -> String {
        let mut template_ids: Vec<&str> = seed.templates.iter().map(|t| t.id.as_str()).collect();
        template_ids.sort_unstable();
        let projection = format!(
            "{}|{:.6}|{:.6}|{}|{}",
            seed.node_id,
            seed.latitude,
            seed.longitude,
            seed.location_name,
            template_ids.join(",")
        );
        hex::encode(Sha256::digest(projection.as_bytes()))
    }

    /// Apply a seed. Returns true when any mutating call was issued.
    pub async fn apply(&self, seed: &ConfigSeed) -> Result<bool, MistError> {
        let signature = Self::signature(seed);
        let is_new = {
            let last = self
                .last_applied_signature
                .lock()
                .expect("signature lock poisoned");
            last.as_deref() != Some(signature.as_str())
        };
        if is_new {
            info!(node_id = %seed.node_id, location = %seed.location_name, "applying config seed");
        } else {
            debug!(node_id = %seed.node_id, "config seed unchanged, verifying");
        }

        let current = self.mist.config_backup().await?;
        let desired = desired_config(
            seed,
            &self.edge_public_url,
            &self.webhook_base,
            &self.balance_url,
        );
        let mutated = match reconcile_diff(&current, &desired) {
            Some(partial) => {
                self.mist.apply_config(partial).await?;
                true
            }
            None => false,
        };

        let mut last = self
            .last_applied_signature
            .lock()
            .expect("signature lock poisoned");
        *last = Some(signature);
        Ok(mutated)
    }
}

// ---------------------------------------------------------------------------
// Desired state
// ---------------------------------------------------------------------------

/// The config subtree this edge owns, in the upstream server's document
/// shape.
pub fn desired_config(
    seed: &ConfigSeed,
    edge_public_url: &str,
    webhook_base: &str,
    balance_url: &str,
) -> Value {
    json!({
        "location": {
            "lat": seed.latitude,
            "lon": seed.longitude,
            "name": seed.location_name,
        },
        "prometheus": prometheus_passphrase(&seed.node_id),
        "triggers": desired_triggers(webhook_base),
        "protocols": desired_outputs(edge_public_url),
        "streams": desired_streams(seed, balance_url),
    })
}

/// Deterministic scrape passphrase derived from the node identity.
fn prometheus_passphrase(node_id: &str) -> String {
    let digest = Sha256::digest(format!("prometheus:{node_id}").as_bytes());
    hex::encode(&digest[..16])
}

/// One handler entry per trigger type, pointing at the local webhook base.
fn desired_triggers(webhook_base: &str) -> Value {
    let all = [
        TriggerType::PushRewrite,
        TriggerType::DefaultStream,
        TriggerType::StreamSource,
        TriggerType::PushOutStart,
        TriggerType::PushEnd,
        TriggerType::UserNew,
        TriggerType::UserEnd,
        TriggerType::StreamBuffer,
        TriggerType::StreamEnd,
        TriggerType::LiveTrackList,
        TriggerType::RecordingEnd,
        TriggerType::RecordingSegment,
    ];
    let mut triggers = Map::new();
    for trigger in all {
        let name = trigger.webhook_name();
        triggers.insert(
            name.to_owned(),
            json!([{
                "handler": format!("{webhook_base}/{name}"),
                "sync": trigger.is_blocking(),
                "streams": [],
                "default": "",
            }]),
        );
    }
    Value::Object(triggers)
}

fn desired_outputs(edge_public_url: &str) -> Value {
    let pubhost = hostname_of(edge_public_url);
    json!([
        { "connector": "HTTP", "pubaddr": format!("{}/", edge_public_url.trim_end_matches('/')) },
        { "connector": "WebRTC", "pubhost": pubhost },
        { "connector": "DTSC" },
        { "connector": "WSRaw" },
    ])
}

fn desired_streams(seed: &ConfigSeed, balance_url: &str) -> Value {
    let mut streams = Map::new();
    for template in &seed.templates {
        let mut processes = default_processes();
        if seed.processing.gateway_available {
            if let Some(gateway_url) = &seed.processing.gateway_url {
                processes.push(abr_process(gateway_url));
            }
        }
        streams.insert(
            template.name.clone(),
            json!({
                "name": template.name,
                "source": format!("balance:{balance_url}?fallback=push://"),
                "processes": processes,
            }),
        );
    }
    Value::Object(streams)
}

/// Always-on audio interop: AAC and Opus renditions of every input.
fn default_processes() -> Vec<Value> {
    vec![
        json!({
            "process": "AudioTranscode",
            "source_codec": "AAC",
            "target_codec": "opus",
        }),
        json!({
            "process": "AudioTranscode",
            "source_codec": "opus",
            "target_codec": "AAC",
        }),
    ]
}

/// ABR ladder through the advertised gateway, guarded to inputs of at
/// least 850×480.
fn abr_process(gateway_url: &str) -> Value {
    json!({
        "process": "ABRTranscode",
        "gateway": gateway_url,
        "min_video_width": ABR_MIN_WIDTH,
        "min_video_height": ABR_MIN_HEIGHT,
    })
}

/// Host portion of a URL, without scheme, port or path.
fn hostname_of(url: &str) -> String {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_port.split(':').next().unwrap_or(host_port).to_owned()
}

// ---------------------------------------------------------------------------
// Diffing
// ---------------------------------------------------------------------------

/// Compare the server's current document with the desired subtree.
///
/// Returns the partial document to apply, or `None` when everything
/// already matches (the idempotent no-op case).
pub fn reconcile_diff(current: &Value, desired: &Value) -> Option<Value> {
    let mut partial = Map::new();

    for key in ["location", "prometheus", "triggers"] {
        if current.get(key) != desired.get(key) {
            partial.insert(key.to_owned(), desired[key].clone());
        }
    }

    if let Some(protocols) = reconcile_protocols(current.get("protocols"), &desired["protocols"]) {
        partial.insert("protocols".to_owned(), protocols);
    }

    if let Some(streams) = reconcile_streams(current.get("streams"), &desired["streams"]) {
        partial.insert("streams".to_owned(), streams);
    }

    if partial.is_empty() {
        None
    } else {
        Some(Value::Object(partial))
    }
}

/// Essential outputs must exist with the desired public address fields;
/// non-essential entries the operator added are preserved.
fn reconcile_protocols(current: Option<&Value>, desired: &Value) -> Option<Value> {
    let current_list = current.and_then(Value::as_array).cloned().unwrap_or_default();
    let desired_list = desired.as_array().cloned().unwrap_or_default();

    let mut changed = false;
    let mut merged: Vec<Value> = current_list
        .iter()
        .filter(|entry| {
            let connector = entry.get("connector").and_then(Value::as_str).unwrap_or("");
            !ESSENTIAL_OUTPUTS.contains(&connector)
        })
        .cloned()
        .collect();

    for wanted in &desired_list {
        let connector = wanted.get("connector").and_then(Value::as_str).unwrap_or("");
        match current_list
            .iter()
            .find(|e| e.get("connector").and_then(Value::as_str) == Some(connector))
        {
            Some(existing) if existing == wanted => merged.push(existing.clone()),
            _ => {
                changed = true;
                merged.push(wanted.clone());
            }
        }
    }

    changed.then_some(Value::Array(merged))
}

/// Template streams must exist with the desired source and processes;
/// other streams are preserved.
fn reconcile_streams(current: Option<&Value>, desired: &Value) -> Option<Value> {
    let current_map = current.and_then(Value::as_object).cloned().unwrap_or_default();
    let desired_map = desired.as_object().cloned().unwrap_or_default();

    let mut changed = false;
    let mut merged = current_map.clone();
    for (name, wanted) in &desired_map {
        if current_map.get(name) != Some(wanted) {
            changed = true;
            merged.insert(name.clone(), wanted.clone());
        }
    }

    changed.then_some(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_protocol::{ProcessingConfig, StreamTemplate};
    use std::sync::Arc;

    fn seed() -> ConfigSeed {
        ConfigSeed {
            node_id: "edge-ams-01".to_owned(),
            latitude: 52.37,
            longitude: 4.89,
            location_name: "Amsterdam".to_owned(),
            templates: vec![
                StreamTemplate {
                    id: "tpl-live".to_owned(),
                    name: "live".to_owned(),
                },
                StreamTemplate {
                    id: "tpl-event".to_owned(),
                    name: "event".to_owned(),
                },
            ],
            processing: ProcessingConfig {
                gateway_available: false,
                gateway_url: None,
            },
            operational_mode: "active".to_owned(),
        }
    }

    // -----------------------------------------------------------------------
    // Fake Mist recording mutations
    // -----------------------------------------------------------------------

    struct FakeMist {
        config: std::sync::Mutex<Value>,
        applies: std::sync::Mutex<Vec<Value>>,
    }

    impl FakeMist {
        fn new() -> Self {
            FakeMist {
                config: std::sync::Mutex::new(json!({})),
                applies: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn apply_count(&self) -> usize {
            self.applies.lock().unwrap().len()
        }
    }

    impl MistApi for FakeMist {
        async fn start_push(&self, _stream: &str, _target: &str) -> Result<(), MistError> {
            Ok(())
        }
        async fn stop_push(&self, _push_id: u64) -> Result<(), MistError> {
            Ok(())
        }
        async fn list_pushes(&self) -> Result<Vec<crate::mist::PushEntry>, MistError> {
            Ok(Vec::new())
        }
        async fn config_backup(&self) -> Result<Value, MistError> {
            Ok(self.config.lock().unwrap().clone())
        }
        async fn apply_config(&self, partial: Value) -> Result<(), MistError> {
            self.applies.lock().unwrap().push(partial.clone());
            let mut config = self.config.lock().unwrap();
            if let (Value::Object(config), Value::Object(partial)) = (&mut *config, partial) {
                for (k, v) in partial {
                    config.insert(k, v);
                }
            }
            Ok(())
        }
        async fn stop_sessions(&self, _stream_names: &[String]) -> Result<(), MistError> {
            Ok(())
        }
    }

    fn reconciler(mist: Arc<FakeMist>) -> ConfigReconciler<FakeMist> {
        ConfigReconciler::new(
            mist,
            "https://edge-ams-01.cdn.test",
            "http://127.0.0.1:8090/webhooks/mist",
            "https://foghorn.test/balance",
        )
    }

    #[tokio::test]
    async fn second_apply_of_same_seed_issues_no_mutations() {
        let mist = Arc::new(FakeMist::new());
        let reconciler = reconciler(Arc::clone(&mist));

        let mutated = reconciler.apply(&seed()).await.unwrap();
        assert!(mutated);
        assert_eq!(mist.apply_count(), 1);

        // Same seed again: read-back only, zero mutating RPCs.
        let mutated = reconciler.apply(&seed()).await.unwrap();
        assert!(!mutated);
        assert_eq!(mist.apply_count(), 1);
    }

    #[tokio::test]
    async fn drifted_output_address_is_corrected() {
        let mist = Arc::new(FakeMist::new());
        let reconciler = reconciler(Arc::clone(&mist));
        reconciler.apply(&seed()).await.unwrap();

        // Simulate drift: someone re-pointed the HTTP output.
        {
            let mut config = mist.config.lock().unwrap();
            config["protocols"][0]["pubaddr"] = json!("https://wrong.example/");
        }
        let mutated = reconciler.apply(&seed()).await.unwrap();
        assert!(mutated);

        let config = mist.config.lock().unwrap();
        let protocols = config["protocols"].as_array().unwrap();
        let http = protocols
            .iter()
            .find(|p| p["connector"] == "HTTP")
            .unwrap();
        assert_eq!(http["pubaddr"], "https://edge-ams-01.cdn.test/");
    }

    #[tokio::test]
    async fn operator_added_outputs_and_streams_survive_reconcile() {
        let mist = Arc::new(FakeMist::new());
        {
            let mut config = mist.config.lock().unwrap();
            *config = json!({
                "protocols": [{ "connector": "RTSP", "port": 5554 }],
                "streams": { "custom": { "name": "custom", "source": "push://" } },
            });
        }
        let reconciler = reconciler(Arc::clone(&mist));
        reconciler.apply(&seed()).await.unwrap();

        let config = mist.config.lock().unwrap();
        let protocols = config["protocols"].as_array().unwrap();
        assert!(protocols.iter().any(|p| p["connector"] == "RTSP"));
        for connector in ESSENTIAL_OUTPUTS {
            assert!(
                protocols.iter().any(|p| p["connector"] == connector),
                "{connector} output missing"
            );
        }
        assert!(config["streams"]["custom"].is_object());
        assert!(config["streams"]["live"].is_object());
        assert!(config["streams"]["event"].is_object());
    }

    #[tokio::test]
    async fn gateway_seed_adds_guarded_abr_process() {
        let mist = Arc::new(FakeMist::new());
        let reconciler = reconciler(Arc::clone(&mist));
        let mut seed = seed();
        seed.processing = ProcessingConfig {
            gateway_available: true,
            gateway_url: Some("https://gw.test".to_owned()),
        };
        reconciler.apply(&seed).await.unwrap();

        let config = mist.config.lock().unwrap();
        let processes = config["streams"]["live"]["processes"].as_array().unwrap();
        // Two audio interop processes plus the ABR ladder.
        assert_eq!(processes.len(), 3);
        let abr = processes
            .iter()
            .find(|p| p["process"] == "ABRTranscode")
            .unwrap();
        assert_eq!(abr["gateway"], "https://gw.test");
        assert_eq!(abr["min_video_width"], 850);
        assert_eq!(abr["min_video_height"], 480);
    }

    #[test]
    fn signature_is_order_independent_for_templates() {
        let a = seed();
        let mut b = seed();
        b.templates.reverse();
        assert_eq!(
            ConfigReconciler::<FakeMist>::signature(&a),
            ConfigReconciler::<FakeMist>::signature(&b)
        );

        let mut c = seed();
        c.location_name = "Rotterdam".to_owned();
        assert_ne!(
            ConfigReconciler::<FakeMist>::signature(&a),
            ConfigReconciler::<FakeMist>::signature(&c)
        );
    }

    #[test]
    fn trigger_handlers_point_at_local_webhooks_with_sync_flags() {
        let desired = desired_triggers("http://127.0.0.1:8090/webhooks/mist");
        let rewrite = &desired["PUSH_REWRITE"][0];
        assert_eq!(
            rewrite["handler"],
            "http://127.0.0.1:8090/webhooks/mist/PUSH_REWRITE"
        );
        assert_eq!(rewrite["sync"], true);
        let segment = &desired["RECORDING_SEGMENT"][0];
        assert_eq!(segment["sync"], false);
    }

    #[test]
    fn hostname_extraction_strips_scheme_port_and_path() {
        assert_eq!(hostname_of("https://edge.cdn.test:8443/x"), "edge.cdn.test");
        assert_eq!(hostname_of("http://10.0.0.1/"), "10.0.0.1");
        assert_eq!(hostname_of("edge.cdn.test"), "edge.cdn.test");
    }
}
