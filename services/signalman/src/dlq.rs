//! Dead-letter queue adapter.
//!
//! Wraps an event handler: on handler error the record is encoded and
//! published to the DLQ topic, and the error is swallowed so the offset
//! advances (the record is preserved, not retried). If the DLQ publish
//! itself fails, the handler's original error is returned so the offset is
//! NOT advanced and the record replays after restart.

use crate::consumer::{EventHandler, HandlerError, TopicRecord};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

const DLQ_SEND_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Dead letter document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
    pub tenant_id: Option<String>,
    pub key_base64: Option<String>,
    pub value_base64: String,
    pub headers: BTreeMap<String, String>,
    pub error: String,
    pub consumer: String,
}

/// Build the dead-letter document for a failed record.
///
/// `tenant_id` comes from the record header or, failing that, the JSON
/// body — the DLQ must stay tenant-attributable for replay tooling.
pub fn build_dead_letter(record: &TopicRecord, error: &str, consumer: &str) -> DeadLetter {
    let tenant_id = record.header_str("tenant_id").or_else(|| {
        record
            .payload
            .as_deref()
            .and_then(|raw| serde_json::from_slice::<serde_json::Value>(raw).ok())
            .and_then(|v| v.get("tenant_id").and_then(|t| t.as_str()).map(ToOwned::to_owned))
    });
    let headers = record
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
        .collect();

    DeadLetter {
        topic: record.topic.clone(),
        partition: record.partition,
        offset: record.offset,
        timestamp: record.timestamp_ms,
        tenant_id,
        key_base64: record.key.as_deref().map(|k| BASE64.encode(k)),
        value_base64: BASE64.encode(record.payload.as_deref().unwrap_or_default()),
        headers,
        error: error.to_owned(),
        consumer: consumer.to_owned(),
    }
}

/// DLQ message key: the original record key, or `topic:partition:offset`.
pub fn dead_letter_key(record: &TopicRecord) -> String {
    match record.key.as_deref() {
        Some(key) if !key.is_empty() => String::from_utf8_lossy(key).into_owned(),
        _ => format!("{}:{}:{}", record.topic, record.partition, record.offset),
    }
}

// ---------------------------------------------------------------------------
// Publisher seam
// ---------------------------------------------------------------------------

/// Publishing seam so the adapter is testable without a broker.
pub trait DlqPublish: Send + Sync + 'static {
    fn publish(
        &self,
        key: String,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), String>> + Send;
}

/// Kafka-backed publisher.
pub struct KafkaDlqPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDlqPublisher {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(KafkaDlqPublisher {
            producer,
            topic: topic.into(),
        })
    }
}

impl DlqPublish for KafkaDlqPublisher {
    async fn publish(&self, key: String, payload: Vec<u8>) -> Result<(), String> {
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        self.producer
            .send(record, DLQ_SEND_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Wraps a handler with dead-lettering.
pub struct DlqAdapter<H: EventHandler, P: DlqPublish> {
    inner: H,
    publisher: P,
    consumer_name: String,
}

impl<H: EventHandler, P: DlqPublish> DlqAdapter<H, P> {
    pub fn new(inner: H, publisher: P, consumer_name: impl Into<String>) -> Self {
        DlqAdapter {
            inner,
            publisher,
            consumer_name: consumer_name.into(),
        }
    }
}

impl<H: EventHandler, P: DlqPublish> EventHandler for DlqAdapter<H, P> {
    async fn handle(&self, record: &TopicRecord) -> Result<(), HandlerError> {
        let original = match self.inner.handle(record).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let letter = build_dead_letter(record, &original.0, &self.consumer_name);
        let payload = match serde_json::to_vec(&letter) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "dead letter encode failed");
                return Err(original);
            }
        };
        match self
            .publisher
            .publish(dead_letter_key(record), payload)
            .await
        {
            Ok(()) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %original,
                    "record dead-lettered"
                );
                Ok(())
            }
            Err(publish_err) => {
                // Keep the offset pinned: the record replays after restart.
                error!(error = %publish_err, "DLQ publish failed");
                Err(original)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn failing_record() -> TopicRecord {
        TopicRecord {
            topic: "events".to_owned(),
            partition: 2,
            offset: 41,
            timestamp_ms: Some(1_700_000_000_000),
            key: Some(b"stream-1".to_vec()),
            payload: Some(br#"{"event_type":"weird","tenant_id":"t3"}"#.to_vec()),
            headers: vec![("source".to_owned(), b"helmsman".to_vec())],
        }
    }

    struct AlwaysFails;
    impl EventHandler for AlwaysFails {
        async fn handle(&self, _record: &TopicRecord) -> Result<(), HandlerError> {
            Err(HandlerError("boom".to_owned()))
        }
    }

    struct RecordingPublisher {
        fail: AtomicBool,
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingPublisher {
        fn new(fail: bool) -> Self {
            RecordingPublisher {
                fail: AtomicBool::new(fail),
                published: Mutex::new(Vec::new()),
            }
        }
    }

    impl DlqPublish for RecordingPublisher {
        async fn publish(&self, key: String, payload: Vec<u8>) -> Result<(), String> {
            if self.fail.load(Ordering::Relaxed) {
                return Err("broker unavailable".to_owned());
            }
            self.published.lock().unwrap().push((key, payload));
            Ok(())
        }
    }

    #[test]
    fn dead_letter_prefers_header_tenant_and_encodes_payloads() {
        let mut record = failing_record();
        record.headers.push(("tenant_id".to_owned(), b"t-header".to_vec()));

        let letter = build_dead_letter(&record, "boom", "signalman-events");
        assert_eq!(letter.tenant_id.as_deref(), Some("t-header"));
        assert_eq!(letter.topic, "events");
        assert_eq!(letter.key_base64.as_deref(), Some(BASE64.encode(b"stream-1").as_str()));
        let decoded = BASE64.decode(&letter.value_base64).unwrap();
        assert_eq!(decoded, record.payload.unwrap());
        assert_eq!(letter.headers["source"], "helmsman");
        assert_eq!(letter.consumer, "signalman-events");
    }

    #[test]
    fn dead_letter_falls_back_to_body_tenant() {
        let letter = build_dead_letter(&failing_record(), "boom", "c");
        assert_eq!(letter.tenant_id.as_deref(), Some("t3"));
    }

    #[test]
    fn key_falls_back_to_coordinates_when_absent() {
        let mut record = failing_record();
        assert_eq!(dead_letter_key(&record), "stream-1");
        record.key = None;
        assert_eq!(dead_letter_key(&record), "events:2:41");
    }

    #[tokio::test]
    async fn successful_dead_letter_swallows_the_error() {
        let publisher = RecordingPublisher::new(false);
        let adapter = DlqAdapter::new(AlwaysFails, publisher, "signalman-events");

        assert!(adapter.handle(&failing_record()).await.is_ok());
        let published = adapter.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let letter: DeadLetter = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(letter.error, "boom");
    }

    #[tokio::test]
    async fn failed_dead_letter_returns_the_original_error() {
        let publisher = RecordingPublisher::new(true);
        let adapter = DlqAdapter::new(AlwaysFails, publisher, "signalman-events");

        let err = adapter.handle(&failing_record()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
