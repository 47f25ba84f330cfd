use metrics::counter;
use tracing::{error, warn};

use courier_common::error::PipelineError;
use courier_common::kafka_consumer::{CommittableUnit, Envelope, OffsetErr};
use courier_common::message::Message;
use courier_common::publish::FeedbackSink;

use crate::processing::MessageProcessor;

pub mod batch;
pub mod large_batch;
pub mod single;

/// Terminal disposition of one unit after dispatch has resolved.
#[derive(Debug)]
pub(crate) enum UnitResolution {
    Committed,
    CommitFailed(OffsetErr),
    Abandoned,
}

/// Spends the unit's commit point according to the dispatch outcome: commit
/// on success, withhold on failure. The only place the single and batch
/// strategies consume a `CommittableUnit`, so the commit-after-resolution
/// ordering holds by construction.
pub(crate) fn resolve_unit(
    strategy: &'static str,
    dispatched: Result<(), PipelineError>,
    unit: CommittableUnit,
) -> UnitResolution {
    match dispatched {
        Ok(()) => match unit.commit() {
            Ok(()) => UnitResolution::Committed,
            Err(err) => {
                error!(strategy, error = %err, "commit failed");
                UnitResolution::CommitFailed(err)
            }
        },
        Err(err) => {
            error!(
                strategy,
                error = %err,
                "unit failed after retries, abandoning"
            );
            unit.abandon();
            UnitResolution::Abandoned
        }
    }
}

/// Shared per-record dispatch contract. Never acknowledges: the outcome is
/// returned to the strategy, which commits at the unit level.
///
/// A record without a decodable payload is logged, counted and treated as
/// processed. Successful records tagged as requiring feedback get a status
/// message published to the feedback channel; a failure of that publish is
/// logged but does not fail the record.
pub(crate) async fn process_envelope(
    envelope: &Envelope,
    processor: &MessageProcessor,
    feedback: &dyn FeedbackSink,
) -> Result<(), PipelineError> {
    let Some(message) = &envelope.payload else {
        warn!(
            topic = %envelope.topic,
            partition = envelope.partition,
            offset = envelope.offset,
            "record without payload, skipping"
        );
        counter!("courier_consumer_empty_payloads_total").increment(1);
        return Ok(());
    };

    processor.process(message)?;

    if message.requires_feedback() {
        if let Err(err) = feedback.publish(Message::feedback_for(message)).await {
            counter!("courier_consumer_feedback_publish_failures_total").increment(1);
            error!(
                message_id = message.id.as_deref().unwrap_or("unknown"),
                error = %err,
                "failed to publish feedback message"
            );
        }
    }

    Ok(())
}
