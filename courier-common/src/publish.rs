use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::message::Message;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::transaction::TransactionalProducer;

/// Coordinates of a durably committed record, reported back to the caller
/// once the send transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub message_id: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Publishes messages to one channel. Each logical send gets its identity
/// assigned before the first attempt, runs inside a transaction scope, and
/// is retried with exponential backoff on transient transport failures.
/// Producer idempotence keeps those retries from committing duplicates.
pub struct MessagePublisher {
    // Serializes transaction scopes: only one may be open per producer
    producer: Mutex<TransactionalProducer>,
    topic: String,
    retry: RetryPolicy,
    send_timeout: Duration,
}

impl MessagePublisher {
    pub fn new(
        producer: TransactionalProducer,
        topic: String,
        retry: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            producer: Mutex::new(producer),
            topic,
            retry,
            send_timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Sends one message, assigning an id and timestamp first if absent.
    /// Completes once the transaction scope around the send has committed,
    /// or with the terminal error once retries are exhausted, leaving no
    /// partial state in the log.
    pub async fn send(&self, key: &str, message: Message) -> Result<DeliveryResult, PipelineError> {
        let mut message = message;
        let message_id = message.ensure_identity();
        // Serialization failures are terminal, they happen before any attempt
        let payload = serde_json::to_string(&message)?;

        let start = tokio::time::Instant::now();
        let producer = &self.producer;
        let topic = self.topic.as_str();
        let payload = payload.as_str();
        let attempt = retry_with_backoff(self.retry, move || async move {
            let producer = producer.lock().await;
            let transaction = producer.begin()?;
            match transaction.send(topic, key, payload).await {
                Ok((partition, offset)) => {
                    transaction.commit()?;
                    Ok((partition, offset))
                }
                Err(err) => {
                    if let Err(abort_err) = transaction.abort() {
                        error!(error = %abort_err, "failed to abort send transaction");
                    }
                    Err(err)
                }
            }
        })
        .await;

        histogram!("courier_producer_send_duration_seconds", "topic" => self.topic.clone())
            .record(start.elapsed().as_secs_f64());

        match attempt {
            Ok((partition, offset)) => {
                counter!("courier_producer_messages_sent_total", "topic" => self.topic.clone())
                    .increment(1);
                info!(
                    message_id = %message_id,
                    topic = %self.topic,
                    partition,
                    offset,
                    "message sent"
                );
                Ok(DeliveryResult {
                    message_id,
                    topic: self.topic.clone(),
                    partition,
                    offset,
                })
            }
            Err(err) => {
                counter!("courier_producer_messages_failed_total", "topic" => self.topic.clone())
                    .increment(1);
                error!(message_id = %message_id, topic = %self.topic, error = %err, "send failed");
                Err(err)
            }
        }
    }

    /// Sends with a freshly generated key, for callers without a routing key.
    pub async fn send_with_generated_key(
        &self,
        message: Message,
    ) -> Result<DeliveryResult, PipelineError> {
        self.send(&Uuid::now_v7().to_string(), message).await
    }

    /// Bounded-wait send for callers that need a synchronous result.
    /// Exceeding the deadline yields a Timeout error, distinct from a
    /// transport failure.
    pub async fn send_sync(
        &self,
        key: &str,
        message: Message,
    ) -> Result<DeliveryResult, PipelineError> {
        match tokio::time::timeout(self.send_timeout, self.send(key, message)).await {
            Ok(result) => result,
            Err(_) => {
                counter!("courier_producer_send_timeouts_total", "topic" => self.topic.clone())
                    .increment(1);
                Err(PipelineError::Timeout)
            }
        }
    }
}

/// Seam between the consumption side and the feedback channel, so the
/// strategies and the recovery path can be exercised against a capturing
/// double in tests.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn publish(&self, message: Message) -> Result<DeliveryResult, PipelineError>;
}

#[async_trait]
impl FeedbackSink for MessagePublisher {
    async fn publish(&self, message: Message) -> Result<DeliveryResult, PipelineError> {
        let key = message
            .id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        self.send(&key, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaConfig;
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;

    async fn publisher_on_mocked_cluster(
        send_timeout: Duration,
    ) -> (MockCluster<'static, DefaultProducerContext>, MessagePublisher) {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("producer".to_string(), Duration::from_secs(30))
            .await;
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_topic: "demo-topic".to_string(),
            kafka_feedback_topic: "feedback-topic".to_string(),
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 5000,
            kafka_compression_codec: "none".to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_tls: false,
        };
        cluster
            .create_topic("demo-topic", 1, 1)
            .expect("failed to create topic");
        let producer = TransactionalProducer::from_config(
            &config,
            "courier-test-tx",
            Duration::from_secs(10),
            handle,
        )
        .expect("failed to create producer");
        let publisher = MessagePublisher::new(
            producer,
            "demo-topic".to_string(),
            RetryPolicy::default(),
            send_timeout,
        );
        (cluster, publisher)
    }

    #[tokio::test]
    async fn send_assigns_identity_and_reports_coordinates() {
        let (_cluster, publisher) = publisher_on_mocked_cluster(Duration::from_secs(10)).await;

        let message = Message::new("Hello", "INFO");
        assert_eq!(message.id, None);

        let result = publisher
            .send("key-1", message)
            .await
            .expect("send should succeed against the mock cluster");

        assert_eq!(result.topic, "demo-topic");
        assert!(result.offset >= 0);
        assert!(!result.message_id.is_empty());
    }

    #[tokio::test]
    async fn send_with_generated_key_works_end_to_end() {
        let (_cluster, publisher) = publisher_on_mocked_cluster(Duration::from_secs(10)).await;

        let result = publisher
            .send_with_generated_key(Message::new("no key", "WARNING"))
            .await
            .expect("send should succeed against the mock cluster");

        assert_eq!(result.topic, "demo-topic");
        assert!(result.offset >= 0);
    }

    #[tokio::test]
    async fn a_timed_out_send_does_not_wedge_the_producer() {
        let (cluster, publisher) = publisher_on_mocked_cluster(Duration::from_millis(100)).await;

        // Slow the broker down past the bounded wait: the send future is
        // cancelled mid-transaction, which must abort the open scope
        cluster
            .broker_round_trip_time(1, Duration::from_secs(2))
            .expect("failed to set broker rtt");
        let result = publisher.send_sync("key-1", Message::new("slow", "INFO")).await;
        assert!(matches!(result, Err(PipelineError::Timeout)));

        // With the broker healthy again, the next scope must open cleanly
        cluster
            .broker_round_trip_time(1, Duration::from_millis(5))
            .expect("failed to reset broker rtt");
        let result = publisher
            .send("key-2", Message::new("after the timeout", "INFO"))
            .await
            .expect("publisher should recover after a timed-out send");
        assert_eq!(result.topic, "demo-topic");
    }
}
