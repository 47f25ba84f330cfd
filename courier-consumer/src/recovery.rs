use std::sync::Arc;

use metrics::counter;
use tracing::{error, info};

use courier_common::kafka_consumer::Envelope;
use courier_common::message::Message;
use courier_common::publish::FeedbackSink;

/// Converts failed records into recovery messages on the feedback channel.
/// This is the capture half of the no-silent-loss invariant: a failing
/// record leaves a trace before its unit is acknowledged away.
pub struct RecoveryPath {
    sink: Arc<dyn FeedbackSink>,
}

impl RecoveryPath {
    pub fn new(sink: Arc<dyn FeedbackSink>) -> Self {
        Self { sink }
    }

    /// Publishes one recovery message per failed record with a payload.
    /// Publish failures are terminal: they are logged and counted for
    /// external alerting but never re-enter this path.
    pub async fn recover(&self, failed: Vec<Envelope>) {
        info!(records = failed.len(), "republishing failed records for recovery");

        for envelope in failed {
            let Some(message) = &envelope.payload else {
                continue;
            };
            let original_id = message.id.clone().unwrap_or_else(|| "unknown".to_string());
            let recovery = Message::recovery_for(
                message,
                &envelope.topic,
                envelope.partition,
                envelope.offset,
            );

            match self.sink.publish(recovery).await {
                Ok(result) => {
                    counter!("courier_consumer_recovery_published_total").increment(1);
                    info!(
                        original_id = %original_id,
                        topic = %result.topic,
                        offset = result.offset,
                        "recovery message published"
                    );
                }
                Err(err) => {
                    counter!("courier_consumer_recovery_publish_failures_total").increment(1);
                    error!(
                        original_id = %original_id,
                        error = %err,
                        "recovery publish failed, record lost to manual repair"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::{envelope, payload, CapturingSink, FailingSink};

    #[tokio::test]
    async fn synthesizes_linked_recovery_messages() {
        let sink = Arc::new(CapturingSink::default());
        let recovery = RecoveryPath::new(sink.clone());

        recovery
            .recover(vec![envelope(3, Some(payload("m-9", "ERROR", "FATAL io")))])
            .await;

        let published = sink.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id.as_deref(), Some("recovery-m-9"));
        assert_eq!(
            published[0].metadata.get("offset").map(String::as_str),
            Some("3")
        );
    }

    #[tokio::test]
    async fn skips_records_without_payloads() {
        let sink = Arc::new(CapturingSink::default());
        let recovery = RecoveryPath::new(sink.clone());

        recovery.recover(vec![envelope(4, None)]).await;

        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failures_are_terminal() {
        let recovery = RecoveryPath::new(Arc::new(FailingSink));

        // Must neither panic nor recurse
        recovery
            .recover(vec![envelope(5, Some(payload("m-10", "ERROR", "FATAL")))])
            .await;
    }
}
