use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors crossing the pipeline's component boundaries.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("kafka transport error: {0}")]
    Transport(#[from] KafkaError),
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("message handler failed: {0}")]
    Handler(String),
    #[error("timed out waiting for delivery acknowledgment")]
    Timeout,
    #[error("failed to publish recovery message for {original_id}: {reason}")]
    RecoveryPublish {
        original_id: String,
        reason: String,
    },
}

impl PipelineError {
    /// Whether retrying the same operation can be expected to succeed.
    /// Serialization failures never can: the payload will not change on
    /// redelivery. Handler failures are retried like transport failures,
    /// the retry wrapper cannot tell them apart.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Transport(_) => true,
            PipelineError::Handler(_) => true,
            PipelineError::Timeout => true,
            PipelineError::Serialization(_) => false,
            PipelineError::RecoveryPublish { .. } => false,
        }
    }
}
