use health::HealthHandle;
use metrics::gauge;
use rdkafka::ClientConfig;

use crate::config::KafkaConfig;

/// Client context wired into the producer so that the rdkafka poll loop
/// reports liveness and queue depths while it is running.
pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();

        gauge!("courier_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("courier_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("courier_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
    }
}

/// Base rdkafka producer configuration shared by both roles.
pub fn producer_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}
