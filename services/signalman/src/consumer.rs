//! Topic consumer glue.
//!
//! Decodes ingested events, classifies them to channels, enforces the
//! tenant guard, and feeds the hub. Commit discipline is at-least-once
//! with head-of-line integrity per partition: after a batch, each
//! partition commits the offset of its last successfully processed record,
//! and a handler failure freezes that partition's commit (and stops
//! processing its later records within the batch) so nothing is skipped on
//! restart.

use crate::hub::Hub;
use crate::messages::{channel_for_event, SYSTEM_CHANNEL};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MAX_BATCH: usize = 100;
const BATCH_DRAIN_WINDOW: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Records and outcomes
// ---------------------------------------------------------------------------

/// One consumed record, detached from the client's borrow.
#[derive(Debug, Clone)]
pub struct TopicRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl TopicRecord {
    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// UTF-8 header value, if present.
    pub fn header_str(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordMeta {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Records for unconfigured topics count as successes for commits.
    UnknownTopic,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Per-topic record handler.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(
        &self,
        record: &TopicRecord,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

// ---------------------------------------------------------------------------
// Batch processing and commit planning
// ---------------------------------------------------------------------------

/// Process one batch with head-of-line integrity: once a handler fails for
/// a partition, its later records in the batch are not invoked at all.
pub async fn process_batch<H: EventHandler>(
    records: &[TopicRecord],
    known_topics: &HashSet<String>,
    handler: &H,
) -> Vec<(RecordMeta, Outcome)> {
    let mut failed_partitions: HashSet<(String, i32)> = HashSet::new();
    let mut results = Vec::with_capacity(records.len());

    for record in records {
        let partition_key = (record.topic.clone(), record.partition);
        if failed_partitions.contains(&partition_key) {
            continue;
        }
        if !known_topics.contains(&record.topic) {
            results.push((record.meta(), Outcome::UnknownTopic));
            continue;
        }
        match handler.handle(record).await {
            Ok(()) => results.push((record.meta(), Outcome::Success)),
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "handler failed, freezing partition for this batch"
                );
                results.push((record.meta(), Outcome::Failure));
                failed_partitions.insert(partition_key);
            }
        }
    }
    results
}

/// Per-partition commit plan: the offset of the last successfully
/// processed record, never advancing past a failure.
pub fn plan_commits(results: &[(RecordMeta, Outcome)]) -> HashMap<(String, i32), i64> {
    let mut last_ok: HashMap<(String, i32), i64> = HashMap::new();
    let mut failed: HashSet<(String, i32)> = HashSet::new();

    for (meta, outcome) in results {
        let key = (meta.topic.clone(), meta.partition);
        if failed.contains(&key) {
            continue;
        }
        match outcome {
            Outcome::Success | Outcome::UnknownTopic => {
                last_ok.insert(key, meta.offset);
            }
            Outcome::Failure => {
                failed.insert(key);
            }
        }
    }
    last_ok
}

// ---------------------------------------------------------------------------
// Hub event handler
// ---------------------------------------------------------------------------

/// Decoded topic payload.
#[derive(Debug, Deserialize)]
struct IngestedEvent {
    event_type: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// Routes ingested events into the hub.
pub struct HubEventHandler {
    hub: Hub,
}

impl HubEventHandler {
    pub fn new(hub: Hub) -> Self {
        HubEventHandler { hub }
    }
}

impl EventHandler for HubEventHandler {
    async fn handle(&self, record: &TopicRecord) -> Result<(), HandlerError> {
        let payload = record
            .payload
            .as_deref()
            .ok_or_else(|| HandlerError("empty payload".to_owned()))?;
        let mut event: IngestedEvent = serde_json::from_slice(payload)
            .map_err(|e| HandlerError(format!("payload decode: {e}")))?;

        // Headers back-fill what the payload omitted.
        if event.tenant_id.is_none() {
            event.tenant_id = record.header_str("tenant_id");
        }
        if event.source.is_none() {
            event.source = record.header_str("source");
        }

        let Some(channel) = channel_for_event(&event.event_type) else {
            debug!(event_type = %event.event_type, "unclassified event dropped");
            return Ok(());
        };

        let mut data = event.data;
        if let (Some(source), Some(object)) = (&event.source, data.as_object_mut()) {
            object.insert("source".to_owned(), serde_json::Value::String(source.clone()));
        }

        if channel == SYSTEM_CHANNEL {
            self.hub.broadcast_infrastructure(&event.event_type, data);
            return Ok(());
        }
        match event.tenant_id {
            Some(tenant_id) => {
                self.hub
                    .broadcast_to_tenant(&tenant_id, &event.event_type, channel, data);
            }
            None => {
                // Cross-tenant leakage guard: no tenant, no delivery.
                warn!(
                    event_type = %event.event_type,
                    channel,
                    "tenant-less event on tenant channel dropped"
                );
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kafka loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Run the consume/process/commit loop until shutdown.
pub async fn run_consumer<H: EventHandler>(
    cfg: ConsumerConfig,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConsumerError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.brokers)
        .set("group.id", &cfg.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()?;
    let topic_refs: Vec<&str> = cfg.topics.iter().map(String::as_str).collect();
    consumer.subscribe(&topic_refs)?;
    let known_topics: HashSet<String> = cfg.topics.iter().cloned().collect();
    info!(topics = ?cfg.topics, group = %cfg.group_id, "consumer started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            batch = collect_batch(&consumer) => {
                if batch.is_empty() {
                    continue;
                }
                let results = process_batch(&batch, &known_topics, &handler).await;
                commit_plan(&consumer, &plan_commits(&results))?;
            }
        }
    }
}

/// Block for one record, then drain briefly to form a batch.
async fn collect_batch(consumer: &StreamConsumer) -> Vec<TopicRecord> {
    let mut records = Vec::new();
    match consumer.recv().await {
        Ok(message) => records.push(to_record(&message)),
        Err(e) => {
            warn!(error = %e, "consumer poll failed");
            return records;
        }
    }
    while records.len() < MAX_BATCH {
        match tokio::time::timeout(BATCH_DRAIN_WINDOW, consumer.recv()).await {
            Ok(Ok(message)) => records.push(to_record(&message)),
            Ok(Err(e)) => {
                warn!(error = %e, "consumer poll failed mid-batch");
                break;
            }
            Err(_) => break,
        }
    }
    records
}

fn to_record(message: &rdkafka::message::BorrowedMessage<'_>) -> TopicRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_owned(), h.value.unwrap_or_default().to_vec()))
                .collect()
        })
        .unwrap_or_default();
    TopicRecord {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp_ms: message.timestamp().to_millis(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        headers,
    }
}

fn commit_plan(
    consumer: &StreamConsumer,
    plan: &HashMap<(String, i32), i64>,
) -> Result<(), ConsumerError> {
    if plan.is_empty() {
        return Ok(());
    }
    let mut tpl = TopicPartitionList::new();
    for ((topic, partition), offset) in plan {
        // Kafka commit offsets name the NEXT record to read.
        tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))?;
    }
    consumer.commit(&tpl, rdkafka::consumer::CommitMode::Async)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn record(topic: &str, partition: i32, offset: i64) -> TopicRecord {
        TopicRecord {
            topic: topic.to_owned(),
            partition,
            offset,
            timestamp_ms: None,
            key: None,
            payload: Some(br#"{"event_type":"stream_lifecycle","tenant_id":"t1"}"#.to_vec()),
            headers: Vec::new(),
        }
    }

    /// Fails on configured offsets, records invocations.
    struct ScriptedHandler {
        fail_offsets: HashSet<i64>,
        invoked: Mutex<Vec<i64>>,
    }

    impl ScriptedHandler {
        fn failing_on(offsets: &[i64]) -> Self {
            ScriptedHandler {
                fail_offsets: offsets.iter().copied().collect(),
                invoked: Mutex::new(Vec::new()),
            }
        }
    }

    impl EventHandler for ScriptedHandler {
        async fn handle(&self, record: &TopicRecord) -> Result<(), HandlerError> {
            self.invoked.lock().unwrap().push(record.offset);
            if self.fail_offsets.contains(&record.offset) {
                Err(HandlerError("scripted failure".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn failure_freezes_partition_for_rest_of_batch() {
        // Offsets 10,11,12 in one partition; handler fails on 11.
        let records = vec![record("e", 0, 10), record("e", 0, 11), record("e", 0, 12)];
        let known: HashSet<String> = ["e".to_owned()].into_iter().collect();
        let handler = ScriptedHandler::failing_on(&[11]);

        let results = process_batch(&records, &known, &handler).await;

        // Handler invoked for 10 and 11 only; 12 skipped.
        assert_eq!(*handler.invoked.lock().unwrap(), vec![10, 11]);

        // Committed offset advances to 10 only; restart resumes at 11.
        let plan = plan_commits(&results);
        assert_eq!(plan.get(&("e".to_owned(), 0)), Some(&10));
    }

    #[tokio::test]
    async fn other_partitions_are_unaffected_by_a_failure() {
        let records = vec![
            record("e", 0, 10),
            record("e", 1, 5),
            record("e", 0, 11),
            record("e", 1, 6),
        ];
        let known: HashSet<String> = ["e".to_owned()].into_iter().collect();
        let handler = ScriptedHandler::failing_on(&[10]);

        let results = process_batch(&records, &known, &handler).await;
        let plan = plan_commits(&results);

        assert_eq!(plan.get(&("e".to_owned(), 0)), None, "partition 0 frozen");
        assert_eq!(plan.get(&("e".to_owned(), 1)), Some(&6));
    }

    #[tokio::test]
    async fn unknown_topics_count_as_successes() {
        let records = vec![record("mystery", 0, 3)];
        let known: HashSet<String> = ["e".to_owned()].into_iter().collect();
        let handler = ScriptedHandler::failing_on(&[]);

        let results = process_batch(&records, &known, &handler).await;
        assert!(handler.invoked.lock().unwrap().is_empty());
        let plan = plan_commits(&results);
        assert_eq!(plan.get(&("mystery".to_owned(), 0)), Some(&3));
    }

    #[tokio::test]
    async fn failure_then_no_later_success_commits_nothing() {
        let records = vec![record("e", 0, 20)];
        let known: HashSet<String> = ["e".to_owned()].into_iter().collect();
        let handler = ScriptedHandler::failing_on(&[20]);

        let results = process_batch(&records, &known, &handler).await;
        assert!(plan_commits(&results).is_empty());
    }

    #[tokio::test]
    async fn hub_handler_drops_tenantless_events_on_tenant_channels() {
        let hub = Hub::start();
        let handler = HubEventHandler::new(hub);

        // No tenant in payload or headers: dropped, but still a success for
        // commit purposes.
        let mut rec = record("e", 0, 1);
        rec.payload = Some(br#"{"event_type":"stream_lifecycle"}"#.to_vec());
        assert!(handler.handle(&rec).await.is_ok());
    }

    #[tokio::test]
    async fn hub_handler_reads_tenant_from_headers() {
        let hub = Hub::start();
        let handler = HubEventHandler::new(hub);

        let mut rec = record("e", 0, 1);
        rec.payload = Some(br#"{"event_type":"stream_lifecycle","data":{"x":1}}"#.to_vec());
        rec.headers = vec![("tenant_id".to_owned(), b"t9".to_vec())];
        assert!(handler.handle(&rec).await.is_ok());
        assert_eq!(rec.header_str("tenant_id").as_deref(), Some("t9"));
    }

    #[tokio::test]
    async fn hub_handler_rejects_undecodable_payloads() {
        let hub = Hub::start();
        let handler = HubEventHandler::new(hub);

        let mut rec = record("e", 0, 1);
        rec.payload = Some(b"{not json".to_vec());
        assert!(handler.handle(&rec).await.is_err());

        rec.payload = None;
        assert!(handler.handle(&rec).await.is_err());
    }
}
