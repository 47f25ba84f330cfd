use envconfig::Envconfig;

use courier_common::config::{EnvMsDuration, KafkaConfig, RetryConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "courier-consumer")]
    pub client_id: String,

    /// Base consumer-group identity. Each strategy derives its own group
    /// from it so all three can run against the same topic concurrently.
    #[envconfig(default = "courier")]
    pub group_id_base: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub retry: RetryConfig,

    // Standard batch strategy
    #[envconfig(default = "100")]
    pub batch_max_poll_records: usize,

    #[envconfig(default = "3")]
    pub batch_concurrency: usize,

    // Single-record strategy
    #[envconfig(default = "3")]
    pub single_concurrency: usize,

    // Large-batch strategy: throughput over latency
    #[envconfig(default = "1000")]
    pub large_batch_max_poll_records: usize,

    #[envconfig(default = "1048576")]
    pub large_batch_fetch_min_bytes: u32, // 1MiB minimum fetch

    #[envconfig(default = "1000")]
    pub large_batch_fetch_max_wait: EnvMsDuration,

    #[envconfig(default = "2")]
    pub large_batch_concurrency: usize,

    /// Fan-out width within one large-batch poll cycle.
    #[envconfig(default = "16")]
    pub large_batch_parallelism: usize,

    #[envconfig(default = "500")]
    pub fetch_max_wait: EnvMsDuration,

    /// How long to wait for the broker to acknowledge feedback and
    /// recovery publishes.
    #[envconfig(default = "10000")]
    pub send_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn batch_group_id(&self) -> String {
        self.group_id_base.clone()
    }

    pub fn single_group_id(&self) -> String {
        format!("{}-single", self.group_id_base)
    }

    pub fn large_batch_group_id(&self) -> String {
        format!("{}-large-batch", self.group_id_base)
    }

    pub fn feedback_group_id(&self) -> String {
        format!("{}-consumer-feedback", self.group_id_base)
    }
}
