use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{error, info};

use courier_common::error::PipelineError;
use courier_common::kafka_consumer::{Envelope, StrategyConsumer};
use courier_common::publish::FeedbackSink;
use courier_common::retry::{retry_with_backoff, RetryPolicy};

use crate::processing::MessageProcessor;
use crate::strategies::{process_envelope, resolve_unit, UnitResolution};

const STRATEGY: &str = "batch";

/// Bounded batches processed sequentially in log order. Any single failure
/// aborts the unit before commit: the whole unit is redelivered by the
/// retry wrapper, then abandoned.
pub struct BatchStrategy {
    consumer: StrategyConsumer,
    processor: Arc<MessageProcessor>,
    feedback: Arc<dyn FeedbackSink>,
    retry: RetryPolicy,
    liveness: HealthHandle,
    max_poll_records: usize,
    collect_wait: Duration,
}

impl BatchStrategy {
    pub fn new(
        consumer: StrategyConsumer,
        processor: Arc<MessageProcessor>,
        feedback: Arc<dyn FeedbackSink>,
        retry: RetryPolicy,
        liveness: HealthHandle,
        max_poll_records: usize,
        collect_wait: Duration,
    ) -> Self {
        Self {
            consumer,
            processor,
            feedback,
            retry,
            liveness,
            max_poll_records,
            collect_wait,
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("batch strategy started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.liveness.report_healthy().await;

            let envelopes = match self
                .consumer
                .collect_unit(self.max_poll_records, self.collect_wait)
                .await
            {
                Ok(envelopes) => envelopes,
                Err(err) => {
                    error!(strategy = STRATEGY, error = %err, "poll failed");
                    counter!("courier_consumer_poll_errors_total", "strategy" => STRATEGY)
                        .increment(1);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if envelopes.is_empty() {
                continue;
            }

            counter!("courier_consumer_records_received_total", "strategy" => STRATEGY)
                .increment(envelopes.len() as u64);
            let start = tokio::time::Instant::now();

            let unit = self.consumer.unit_for(&envelopes);
            let envelopes_ref = envelopes.as_slice();
            let processor = self.processor.as_ref();
            let feedback = self.feedback.as_ref();
            let outcome = retry_with_backoff(self.retry, move || {
                dispatch_sequential(envelopes_ref, processor, feedback)
            })
            .await;

            histogram!("courier_consumer_unit_processing_seconds", "strategy" => STRATEGY)
                .record(start.elapsed().as_secs_f64());

            if outcome.is_err() {
                counter!("courier_consumer_records_failed_total", "strategy" => STRATEGY)
                    .increment(envelopes.len() as u64);
            }
            if let UnitResolution::Committed = resolve_unit(STRATEGY, outcome, unit) {
                self.liveness.report_commit().await;
                info!(
                    strategy = STRATEGY,
                    records = envelopes.len(),
                    "unit processed and committed"
                );
            }
        }
        info!("batch strategy stopped");
    }
}

/// All-or-nothing dispatch: stops at the first failure so the unit can be
/// retried or abandoned as a whole.
pub(crate) async fn dispatch_sequential(
    envelopes: &[Envelope],
    processor: &MessageProcessor,
    feedback: &dyn FeedbackSink,
) -> Result<(), PipelineError> {
    for envelope in envelopes {
        process_envelope(envelope, processor, feedback).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::{envelope, payload, CapturingSink};

    #[tokio::test]
    async fn processes_every_record_in_order() {
        let processor = MessageProcessor::new();
        let sink = CapturingSink::default();
        let unit = vec![
            envelope(0, Some(payload("m-1", "INFO", "a"))),
            envelope(1, Some(payload("m-2", "WARNING", "b"))),
            envelope(2, None),
            envelope(3, Some(payload("m-3", "AUDIT", "c"))),
        ];

        dispatch_sequential(&unit, &processor, &sink).await.unwrap();

        // Null payload counted as processed without reaching a handler
        assert_eq!(processor.processed_count(), 3);
    }

    #[tokio::test]
    async fn first_failure_aborts_the_unit_before_later_records() {
        let processor = MessageProcessor::new();
        let sink = CapturingSink::default();
        let unit = vec![
            envelope(0, Some(payload("m-1", "INFO", "fine"))),
            envelope(1, Some(payload("m-2", "ERROR", "FATAL breakage"))),
            envelope(2, Some(payload("m-3", "INFO", "never reached"))),
        ];

        let result = dispatch_sequential(&unit, &processor, &sink).await;

        assert!(matches!(result, Err(PipelineError::Handler(_))));
        assert_eq!(processor.processed_count(), 1);
        assert!(processor.processed_message("m-3").is_none());
    }
}
