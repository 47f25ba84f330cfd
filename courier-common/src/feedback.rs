use std::time::Duration;

use health::HealthHandle;
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::kafka_consumer::{Envelope, StrategyConsumer};

/// Terminal outcome of one feedback record. The feedback path never
/// publishes anywhere, so this is all there is to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    /// Empty or undecodable payload, acknowledged and dropped
    Empty,
    /// Logged and counted
    Processed,
}

/// Single-record drain of the feedback channel, run by both roles under
/// their own consumer-group identities. A terminal sink: it never calls
/// back into any publisher, which is what breaks the feedback cycle.
pub struct FeedbackLoop {
    consumer: StrategyConsumer,
    role: &'static str,
    liveness: HealthHandle,
    poll_wait: Duration,
}

impl FeedbackLoop {
    pub fn new(consumer: StrategyConsumer, role: &'static str, liveness: HealthHandle) -> Self {
        Self {
            consumer,
            role,
            liveness,
            poll_wait: Duration::from_secs(1),
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(role = self.role, "feedback loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.liveness.report_healthy().await;

            let envelope =
                match tokio::time::timeout(self.poll_wait, self.consumer.recv_one()).await {
                    Err(_) => continue,
                    Ok(Err(err)) => {
                        error!(role = self.role, error = %err, "feedback poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    Ok(Ok(envelope)) => envelope,
                };

            let unit = self.consumer.unit_for(std::slice::from_ref(&envelope));
            _ = handle_feedback(self.role, &envelope);
            match unit.commit() {
                Ok(()) => self.liveness.report_commit().await,
                Err(err) => error!(role = self.role, error = %err, "feedback commit failed"),
            }
        }
        info!(role = self.role, "feedback loop stopped");
    }
}

/// Role-specific handling is a log line and a counter; both outcomes are
/// acknowledged by the caller.
pub fn handle_feedback(role: &'static str, envelope: &Envelope) -> FeedbackOutcome {
    let Some(message) = &envelope.payload else {
        debug!(role, offset = envelope.offset, "empty feedback payload");
        return FeedbackOutcome::Empty;
    };

    counter!("courier_feedback_received_total", "role" => role).increment(1);
    info!(
        role,
        message_id = message.id.as_deref().unwrap_or("unknown"),
        message_type = message.message_type.as_deref().unwrap_or(""),
        original_id = message
            .metadata
            .get("originalMessageId")
            .map(String::as_str)
            .unwrap_or("unknown"),
        "feedback message received"
    );
    FeedbackOutcome::Processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn envelope_with(payload: Option<Message>) -> Envelope {
        Envelope {
            topic: "feedback-topic".to_string(),
            partition: 0,
            offset: 9,
            key: None,
            payload,
        }
    }

    #[test]
    fn recovery_messages_are_drained_without_republishing() {
        // handle_feedback has no producer to call: receiving a recovery
        // message can only log and count before the caller acknowledges.
        let original = Message {
            id: Some("m-7".to_string()),
            ..Message::new("boom", "ERROR")
        };
        let recovery = Message::recovery_for(&original, "demo-topic", 0, 41);

        let outcome = handle_feedback("producer", &envelope_with(Some(recovery)));
        assert_eq!(outcome, FeedbackOutcome::Processed);
    }

    #[test]
    fn empty_payloads_are_acknowledged_and_dropped() {
        let outcome = handle_feedback("producer", &envelope_with(None));
        assert_eq!(outcome, FeedbackOutcome::Empty);
    }
}
