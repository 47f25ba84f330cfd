use envconfig::Envconfig;

use courier_common::config::{EnvMsDuration, KafkaConfig, RetryConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    /// Also seeds the transactional id, so each producer instance must get
    /// its own client id.
    #[envconfig(default = "courier-producer")]
    pub client_id: String,

    /// Base consumer-group identity, shared with the consumer role. The
    /// producer-side feedback drain derives its own group from it.
    #[envconfig(default = "courier")]
    pub group_id_base: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub retry: RetryConfig,

    /// Bounded wait for callers that need a synchronous send result.
    #[envconfig(default = "10000")]
    pub send_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transactional_id(&self) -> String {
        format!("{}-tx", self.client_id)
    }

    pub fn feedback_group_id(&self) -> String {
        format!("{}-producer", self.group_id_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_group_is_distinct_from_the_primary_groups() {
        let config = Config::init_from_env().expect("failed to load default config");
        assert_eq!(config.feedback_group_id(), "courier-producer");
        assert_eq!(config.transactional_id(), "courier-producer-tx");
    }
}
