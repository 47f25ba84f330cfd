pub mod config;
pub mod error;
pub mod feedback;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod message;
pub mod metrics;
pub mod publish;
pub mod retry;
pub mod transaction;
