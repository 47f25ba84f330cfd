use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod config;
mod processing;
mod recovery;
mod strategies;

use courier_common::feedback::FeedbackLoop;
use courier_common::kafka_consumer::{FetchTuning, StrategyConsumer};
use courier_common::metrics::{serve, setup_metrics_routes};
use courier_common::publish::{FeedbackSink, MessagePublisher};
use courier_common::transaction::TransactionalProducer;
use health::HealthRegistry;

use config::Config;
use processing::MessageProcessor;
use recovery::RecoveryPath;
use strategies::batch::BatchStrategy;
use strategies::large_batch::LargeBatchStrategy;
use strategies::single::SingleStrategy;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().expect("malformed directive")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "courier consumer"
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("starting courier consumer...");

    let config = Config::init_from_env()?;
    let retry_policy = config.retry.policy();
    let liveness = HealthRegistry::new("liveness");

    // Health and metrics server
    let router_liveness = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || ready(router_liveness.get_status())))
        .route("/_liveness", {
            let registry = liveness.clone();
            get(move || ready(registry.get_status()))
        });
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start health server");
    });

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
        info!("shutdown signal received, draining in-flight units");
        _ = shutdown_tx.send(true);
    });

    // Publisher for feedback and recovery messages, shared by all strategies
    let producer_liveness = liveness
        .register("feedback_producer".to_string(), Duration::from_secs(30))
        .await;
    let producer = TransactionalProducer::from_config(
        &config.kafka,
        &format!("{}-tx", config.client_id),
        Duration::from_secs(15),
        producer_liveness,
    )?;
    let feedback_publisher: Arc<dyn FeedbackSink> = Arc::new(MessagePublisher::new(
        producer,
        config.kafka.kafka_feedback_topic.clone(),
        retry_policy,
        config.send_timeout.0,
    ));

    let processor = Arc::new(MessageProcessor::new());
    let mut workers = JoinSet::new();

    // Single-record strategy workers
    for worker in 0..config.single_concurrency {
        let consumer = StrategyConsumer::new(
            &config.kafka,
            &config.kafka.kafka_topic,
            &config.single_group_id(),
            &FetchTuning {
                fetch_min_bytes: 1,
                fetch_max_wait: config.fetch_max_wait.0,
            },
        )?;
        let handle = liveness
            .register(format!("single-{worker}"), Duration::from_secs(30))
            .await;
        let strategy = SingleStrategy::new(
            consumer,
            processor.clone(),
            feedback_publisher.clone(),
            retry_policy,
            handle,
            config.fetch_max_wait.0,
        );
        workers.spawn(strategy.run(shutdown_rx.clone()));
    }

    // Standard batch strategy workers
    for worker in 0..config.batch_concurrency {
        let consumer = StrategyConsumer::new(
            &config.kafka,
            &config.kafka.kafka_topic,
            &config.batch_group_id(),
            &FetchTuning {
                fetch_min_bytes: 1,
                fetch_max_wait: config.fetch_max_wait.0,
            },
        )?;
        let handle = liveness
            .register(format!("batch-{worker}"), Duration::from_secs(30))
            .await;
        let strategy = BatchStrategy::new(
            consumer,
            processor.clone(),
            feedback_publisher.clone(),
            retry_policy,
            handle,
            config.batch_max_poll_records,
            config.fetch_max_wait.0,
        );
        workers.spawn(strategy.run(shutdown_rx.clone()));
    }

    // Large-batch strategy workers, fewer of them to bound resource use
    for worker in 0..config.large_batch_concurrency {
        let consumer = StrategyConsumer::new(
            &config.kafka,
            &config.kafka.kafka_topic,
            &config.large_batch_group_id(),
            &FetchTuning {
                fetch_min_bytes: config.large_batch_fetch_min_bytes,
                fetch_max_wait: config.large_batch_fetch_max_wait.0,
            },
        )?;
        let handle = liveness
            .register(format!("large-batch-{worker}"), Duration::from_secs(30))
            .await;
        let strategy = LargeBatchStrategy::new(
            consumer,
            processor.clone(),
            feedback_publisher.clone(),
            RecoveryPath::new(feedback_publisher.clone()),
            handle,
            config.large_batch_max_poll_records,
            config.large_batch_fetch_max_wait.0,
            config.large_batch_parallelism,
        );
        workers.spawn(strategy.run(shutdown_rx.clone()));
    }

    // This role's drain of the feedback channel, under its own group
    let feedback_consumer = StrategyConsumer::new(
        &config.kafka,
        &config.kafka.kafka_feedback_topic,
        &config.feedback_group_id(),
        &FetchTuning::default(),
    )?;
    let feedback_handle = liveness
        .register("feedback".to_string(), Duration::from_secs(30))
        .await;
    let feedback_loop = FeedbackLoop::new(feedback_consumer, "consumer", feedback_handle);
    workers.spawn(feedback_loop.run(shutdown_rx.clone()));

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "worker task failed");
        }
    }

    info!("courier consumer shut down");
    Ok(())
}
