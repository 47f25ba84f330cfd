use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, Message as KafkaMessage};
use tracing::{info, warn};

use crate::config::KafkaConfig;
use crate::message::Message;

/// One positioned record read from a channel. Decoded eagerly so that the
/// strategies only ever deal with owned data.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// None for empty payloads and for payloads that failed to decode.
    /// Both are disposed of without dispatch: a malformed payload will not
    /// decode any better on redelivery.
    pub payload: Option<Message>,
}

impl Envelope {
    pub fn decode(message: &BorrowedMessage<'_>) -> Envelope {
        let payload = match message.payload() {
            None => None,
            Some(bytes) => match serde_json::from_slice::<Message>(bytes) {
                Ok(decoded) => Some(decoded),
                Err(err) => {
                    counter!("courier_consumer_decode_failures_total").increment(1);
                    warn!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        error = %err,
                        "failed to decode record payload, disposing"
                    );
                    None
                }
            },
        };
        Envelope {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            payload,
        }
    }
}

/// Fetch tuning for one strategy's consumer, the main lever between the
/// latency-oriented and throughput-oriented strategies.
#[derive(Debug, Clone)]
pub struct FetchTuning {
    pub fetch_min_bytes: u32,
    pub fetch_max_wait: Duration,
}

impl Default for FetchTuning {
    fn default() -> Self {
        FetchTuning {
            fetch_min_bytes: 1,
            fetch_max_wait: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

/// Manual-commit consumer subscribed to a single topic under its own group
/// identity. Auto-commit and auto-store are disabled: offsets only advance
/// through `CommittableUnit::commit`, causally after processing.
#[derive(Clone)]
pub struct StrategyConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

impl StrategyConsumer {
    pub fn new(
        config: &KafkaConfig,
        topic: &str,
        group_id: &str,
        tuning: &FetchTuning,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("isolation.level", "read_committed")
            .set("fetch.min.bytes", tuning.fetch_min_bytes.to_string())
            .set(
                "fetch.wait.max.ms",
                tuning.fetch_max_wait.as_millis().to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[topic])?;
        info!(topic, group_id, "consumer subscribed");

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: topic.to_string(),
            }),
        })
    }

    /// Receives and decodes a single record.
    pub async fn recv_one(&self) -> Result<Envelope, KafkaError> {
        let message = self.inner.consumer.recv().await?;
        Ok(Envelope::decode(&message))
    }

    /// Collects up to `max_records` records for one poll cycle, returning
    /// early once `max_wait` passes without a new record. An empty unit
    /// means the cycle had nothing to do.
    pub async fn collect_unit(
        &self,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<Envelope>, KafkaError> {
        let mut unit = Vec::with_capacity(max_records);

        while unit.len() < max_records {
            match tokio::time::timeout(max_wait, self.inner.consumer.recv()).await {
                Ok(Ok(message)) => unit.push(Envelope::decode(&message)),
                Ok(Err(err)) => {
                    if unit.is_empty() {
                        return Err(err);
                    }
                    warn!(error = %err, "poll failed mid-unit, dispatching partial unit");
                    break;
                }
                // Timeout: the cycle is over, return what we have
                Err(_) => break,
            }
        }

        Ok(unit)
    }

    /// Captures the commit point for a unit before dispatch. The returned
    /// value is the only way to advance offsets, and consumes itself on
    /// commit, so a unit cannot be acknowledged twice or concurrently with
    /// its own dispatch outcome.
    pub fn unit_for(&self, envelopes: &[Envelope]) -> CommittableUnit {
        let mut offsets: HashMap<i32, i64> = HashMap::new();
        for envelope in envelopes {
            let entry = offsets.entry(envelope.partition).or_insert(envelope.offset);
            *entry = (*entry).max(envelope.offset);
        }
        CommittableUnit {
            handle: Arc::downgrade(&self.inner),
            offsets,
        }
    }
}

/// The pending acknowledgment for one unit of records: the highest offset
/// per partition seen in the unit.
pub struct CommittableUnit {
    handle: Weak<Inner>,
    offsets: HashMap<i32, i64>,
}

impl CommittableUnit {
    /// Stores the unit's offsets and commits them synchronously
    /// (manual-immediate). Must only be called once every envelope in the
    /// unit has a terminal dispatch outcome.
    pub fn commit(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        for (partition, offset) in &self.offsets {
            inner
                .consumer
                .store_offset(&inner.topic, *partition, *offset)?;
        }
        inner.consumer.commit_consumer_state(CommitMode::Sync)?;
        Ok(())
    }

    /// Withholds the commit. The unit's records stay uncommitted and will be
    /// redelivered after a restart, or can be repaired manually.
    pub fn abandon(self) {
        warn!(
            offsets = ?self.offsets,
            "unit abandoned, offsets withheld for redelivery"
        );
        counter!("courier_consumer_units_abandoned_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(partition: i32, offset: i64) -> Envelope {
        Envelope {
            topic: "demo-topic".to_string(),
            partition,
            offset,
            key: None,
            payload: None,
        }
    }

    #[tokio::test]
    async fn unit_tracks_the_highest_offset_per_partition() {
        let config = KafkaConfig {
            kafka_hosts: "localhost:9092".to_string(),
            kafka_topic: "demo-topic".to_string(),
            kafka_feedback_topic: "feedback-topic".to_string(),
            kafka_producer_linger_ms: 20,
            kafka_producer_queue_mib: 400,
            kafka_message_timeout_ms: 20000,
            kafka_compression_codec: "none".to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_tls: false,
        };
        // Client creation does not contact the brokers yet
        let consumer =
            StrategyConsumer::new(&config, "demo-topic", "unit-test-group", &FetchTuning::default())
                .expect("failed to build consumer");

        let unit = consumer.unit_for(&[
            envelope(0, 3),
            envelope(0, 7),
            envelope(1, 2),
            envelope(0, 5),
        ]);
        assert_eq!(unit.offsets.get(&0), Some(&7));
        assert_eq!(unit.offsets.get(&1), Some(&2));
    }

    #[test]
    fn commit_fails_once_the_consumer_is_gone() {
        let unit = CommittableUnit {
            handle: Weak::new(),
            offsets: HashMap::from([(0, 12)]),
        };
        assert!(matches!(unit.commit(), Err(OffsetErr::Gone)));
    }
}
