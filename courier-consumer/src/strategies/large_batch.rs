use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, histogram};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use courier_common::kafka_consumer::{Envelope, StrategyConsumer};
use courier_common::publish::FeedbackSink;

use crate::processing::MessageProcessor;
use crate::recovery::RecoveryPath;
use crate::strategies::process_envelope;

const STRATEGY: &str = "large-batch";

/// Throughput-oriented strategy: large units dispatched in parallel, which
/// relaxes per-partition processing order. Failures are isolated per record
/// instead of aborting the unit; the unit is committed unconditionally and
/// the failures go to the recovery path.
///
/// A crash between the commit and the recovery publish loses the failure
/// record: recovery messages are at-most-once.
pub struct LargeBatchStrategy {
    consumer: StrategyConsumer,
    processor: Arc<MessageProcessor>,
    feedback: Arc<dyn FeedbackSink>,
    recovery: RecoveryPath,
    liveness: HealthHandle,
    max_poll_records: usize,
    collect_wait: Duration,
    parallelism: usize,
}

impl LargeBatchStrategy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: StrategyConsumer,
        processor: Arc<MessageProcessor>,
        feedback: Arc<dyn FeedbackSink>,
        recovery: RecoveryPath,
        liveness: HealthHandle,
        max_poll_records: usize,
        collect_wait: Duration,
        parallelism: usize,
    ) -> Self {
        Self {
            consumer,
            processor,
            feedback,
            recovery,
            liveness,
            max_poll_records,
            collect_wait,
            parallelism,
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("large-batch strategy started");
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

            let received = envelopes.len();
            counter!("courier_consumer_records_received_total", "strategy" => STRATEGY)
                .increment(received as u64);
            let start = tokio::time::Instant::now();

            let unit = self.consumer.unit_for(&envelopes);
            let failed = dispatch_parallel(
                envelopes,
                self.processor.clone(),
                self.feedback.clone(),
                self.parallelism,
            )
            .await;

            histogram!("courier_consumer_unit_processing_seconds", "strategy" => STRATEGY)
                .record(start.elapsed().as_secs_f64());

            // Commit first, successes consumed, failures already captured
            match unit.commit() {
                Ok(()) => self.liveness.report_commit().await,
                Err(err) => error!(strategy = STRATEGY, error = %err, "commit failed"),
            }

            if !failed.is_empty() {
                warn!(
                    strategy = STRATEGY,
                    failed = failed.len(),
                    total = received,
                    "records failed dispatch, handing to recovery"
                );
                self.recovery.recover(failed).await;
            } else {
                info!(
                    strategy = STRATEGY,
                    records = received,
                    "unit processed and committed"
                );
            }
        }
        info!("large-batch strategy stopped");
    }
}

/// Fans one unit out across `parallelism` workers, isolating each record's
/// failure into the shared failure list. Every worker is joined before this
/// returns, so the caller only commits after all records are resolved.
pub(crate) async fn dispatch_parallel(
    envelopes: Vec<Envelope>,
    processor: Arc<MessageProcessor>,
    feedback: Arc<dyn FeedbackSink>,
    parallelism: usize,
) -> Vec<Envelope> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let mut workers = JoinSet::new();

    for envelope in envelopes {
        let semaphore = semaphore.clone();
        let processor = processor.clone();
        let feedback = feedback.clone();
        let failures = failures.clone();
        workers.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("dispatch semaphore closed");
            if let Err(err) = process_envelope(&envelope, &processor, feedback.as_ref()).await {
                counter!("courier_consumer_records_failed_total", "strategy" => STRATEGY)
                    .increment(1);
                warn!(
                    strategy = STRATEGY,
                    partition = envelope.partition,
                    offset = envelope.offset,
                    error = %err,
                    "record failed dispatch, capturing for recovery"
                );
                failures.lock().await.push(envelope);
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!(strategy = STRATEGY, error = %err, "dispatch worker panicked");
        }
    }

    match Arc::try_unwrap(failures) {
        Ok(failures) => failures.into_inner(),
        // Unreachable once all workers are joined, but don't panic over it
        Err(failures) => failures.lock().await.drain(..).collect(),
    }
}
