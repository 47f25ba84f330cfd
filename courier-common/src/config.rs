use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::retry::RetryPolicy;

/// Primary data channel, written by the publisher role.
pub const PRIMARY_TOPIC: &str = "demo-topic";
/// Secondary channel carrying originator-directed status and recovery
/// messages. One physical topic for both directions, disambiguated by
/// message type and metadata.
pub const FEEDBACK_TOPIC: &str = "feedback-topic";

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "demo-topic")]
    pub kafka_topic: String,

    #[envconfig(default = "feedback-topic")]
    pub kafka_feedback_topic: String,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

/// Retry tuning shared by the publisher and the single/batch strategies.
#[derive(Envconfig, Clone)]
pub struct RetryConfig {
    #[envconfig(default = "3")]
    pub max_retries: u32,

    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "100000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.backoff_coefficient,
            self.initial_interval.0,
            Some(self.maximum_interval.0),
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millisecond_durations() {
        let parsed = "1500".parse::<EnvMsDuration>().unwrap();
        assert_eq!(parsed.0, Duration::from_millis(1500));
        assert!("not-a-number".parse::<EnvMsDuration>().is_err());
    }

    #[test]
    fn retry_config_builds_an_exponential_policy() {
        let config = RetryConfig {
            max_retries: 3,
            backoff_coefficient: 2,
            initial_interval: EnvMsDuration(Duration::from_secs(1)),
            maximum_interval: EnvMsDuration(Duration::from_secs(100)),
        };
        let policy = config.policy();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.time_until_next_retry(2), Duration::from_secs(4));
    }
}
