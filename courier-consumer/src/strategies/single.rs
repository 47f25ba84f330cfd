use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{error, info};

use courier_common::kafka_consumer::StrategyConsumer;
use courier_common::publish::FeedbackSink;
use courier_common::retry::{retry_with_backoff, RetryPolicy};

use crate::processing::MessageProcessor;
use crate::strategies::{process_envelope, resolve_unit, UnitResolution};

const STRATEGY: &str = "single";

/// One record per unit, processed in log order. A dispatch failure is
/// redelivered in place by the retry wrapper; once retries are exhausted
/// the unit is abandoned with its commit withheld.
pub struct SingleStrategy {
    consumer: StrategyConsumer,
    processor: Arc<MessageProcessor>,
    feedback: Arc<dyn FeedbackSink>,
    retry: RetryPolicy,
    liveness: HealthHandle,
    poll_wait: Duration,
}

impl SingleStrategy {
    pub fn new(
        consumer: StrategyConsumer,
        processor: Arc<MessageProcessor>,
        feedback: Arc<dyn FeedbackSink>,
        retry: RetryPolicy,
        liveness: HealthHandle,
        poll_wait: Duration,
    ) -> Self {
        Self {
            consumer,
            processor,
            feedback,
            retry,
            liveness,
            poll_wait,
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("single-record strategy started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.liveness.report_healthy().await;

            let envelope =
                match tokio::time::timeout(self.poll_wait, self.consumer.recv_one()).await {
                    Err(_) => continue,
                    Ok(Err(err)) => {
                        error!(strategy = STRATEGY, error = %err, "poll failed");
                        counter!("courier_consumer_poll_errors_total", "strategy" => STRATEGY)
                            .increment(1);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    Ok(Ok(envelope)) => envelope,
                };

            counter!("courier_consumer_records_received_total", "strategy" => STRATEGY)
                .increment(1);
            let start = tokio::time::Instant::now();

            // Commit point captured before dispatch, consumed exactly once after
            let unit = self.consumer.unit_for(std::slice::from_ref(&envelope));
            let envelope_ref = &envelope;
            let processor = self.processor.as_ref();
            let feedback = self.feedback.as_ref();
            let outcome = retry_with_backoff(self.retry, move || {
                process_envelope(envelope_ref, processor, feedback)
            })
            .await;

            histogram!("courier_consumer_unit_processing_seconds", "strategy" => STRATEGY)
                .record(start.elapsed().as_secs_f64());

            if outcome.is_err() {
                counter!("courier_consumer_records_failed_total", "strategy" => STRATEGY)
                    .increment(1);
            }
            if let UnitResolution::Committed = resolve_unit(STRATEGY, outcome, unit) {
                self.liveness.report_commit().await;
            }
        }
        info!("single-record strategy stopped");
    }
}
