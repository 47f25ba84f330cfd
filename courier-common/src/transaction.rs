use std::time::Duration;

use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::error::PipelineError;
use crate::kafka_producer::{producer_client_config, KafkaContext};

/// Idempotent, transaction-capable producer. One transaction scope is open
/// at a time per producer; callers serialize scopes themselves (the
/// publisher keeps the producer behind a mutex).
pub struct TransactionalProducer {
    inner: FutureProducer<KafkaContext>,
    timeout: Duration,
}

impl TransactionalProducer {
    pub fn from_config(
        config: &KafkaConfig,
        transactional_id: &str,
        timeout: Duration,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = producer_client_config(config);
        client_config
            .set("transactional.id", transactional_id)
            .set("enable.idempotence", "true")
            .set("acks", "all");

        debug!("rdkafka configuration: {:?}", client_config);
        let api: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext::from(liveness))?;

        // "Ping" the Kafka brokers by requesting metadata
        match api
            .client()
            .fetch_metadata(None, std::time::Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        api.init_transactions(timeout)?;

        Ok(TransactionalProducer {
            inner: api,
            timeout,
        })
    }

    /// Opens a transaction scope. The returned guard must be consumed by
    /// `commit` or `abort` before another scope can be opened; dropping it
    /// mid-scope (a cancelled send future) aborts the transaction so the
    /// producer does not stay stuck in an open one.
    pub fn begin(&self) -> Result<KafkaTransaction<'_>, KafkaError> {
        self.inner.begin_transaction()?;
        Ok(KafkaTransaction {
            producer: self,
            completed: false,
        })
    }
}

pub struct KafkaTransaction<'a> {
    producer: &'a TransactionalProducer,
    completed: bool,
}

impl KafkaTransaction<'_> {
    /// Sends one record inside the scope and waits for the broker
    /// acknowledgment, returning the partition and offset it landed at.
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &str,
    ) -> Result<(i32, i64), PipelineError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        match self.producer.inner.send(record, self.producer.timeout).await {
            Ok((partition, offset)) => Ok((partition, offset)),
            Err((err, _)) => Err(PipelineError::Transport(err)),
        }
    }

    pub fn commit(mut self) -> Result<(), KafkaError> {
        self.completed = true;
        self.producer.inner.commit_transaction(self.producer.timeout)
    }

    pub fn abort(mut self) -> Result<(), KafkaError> {
        self.completed = true;
        self.producer.inner.abort_transaction(self.producer.timeout)
    }
}

impl Drop for KafkaTransaction<'_> {
    fn drop(&mut self) {
        if !self.completed {
            if let Err(err) = self.producer.inner.abort_transaction(self.producer.timeout) {
                error!(error = %err, "failed to abort dropped transaction scope");
            }
        }
    }
}
