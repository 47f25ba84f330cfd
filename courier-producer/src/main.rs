use std::future::ready;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod config;

use courier_common::feedback::FeedbackLoop;
use courier_common::kafka_consumer::{FetchTuning, StrategyConsumer};
use courier_common::metrics::{serve, setup_metrics_routes};
use courier_common::publish::MessagePublisher;
use courier_common::transaction::TransactionalProducer;
use health::HealthRegistry;

use config::Config;

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
    "courier producer"
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("starting courier producer...");

    let config = Config::init_from_env()?;
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
        info!("shutdown signal received");
        _ = shutdown_tx.send(true);
    });

    // Publisher for the primary channel, handed to the submission surface
    let producer_liveness = liveness
        .register("producer".to_string(), Duration::from_secs(30))
        .await;
    let producer = TransactionalProducer::from_config(
        &config.kafka,
        &config.transactional_id(),
        Duration::from_secs(15),
        producer_liveness,
    )?;
    let publisher = MessagePublisher::new(
        producer,
        config.kafka.kafka_topic.clone(),
        config.retry.policy(),
        config.send_timeout.0,
    );
    info!(topic = publisher.topic(), "publisher ready");

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
    let feedback_loop = FeedbackLoop::new(feedback_consumer, "producer", feedback_handle);
    feedback_loop.run(shutdown_rx).await;

    info!("courier producer shut down");
    Ok(())
}
