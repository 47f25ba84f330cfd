use std::collections::HashMap;
use std::sync::RwLock;

use metrics::counter;
use tracing::{debug, error, info, warn};

use courier_common::error::PipelineError;
use courier_common::message::{Message, MessageKind};

/// Content marker that makes the ERROR handler fail, exercising the retry
/// and recovery paths end to end.
const FATAL_MARKER: &str = "FATAL";

/// Per-record business logic behind the shared dispatch contract. Selects a
/// handler from the closed kind enumeration, with unknown tags landing on
/// the default handler.
#[derive(Default)]
pub struct MessageProcessor {
    // In-memory record of processed messages, keyed by id
    processed: RwLock<HashMap<String, Message>>,
}

impl MessageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&self, message: &Message) -> Result<(), PipelineError> {
        debug!(
            message_id = message.id.as_deref().unwrap_or("unknown"),
            "processing message"
        );

        match message.kind() {
            MessageKind::Info => self.handle_info(message),
            MessageKind::Warning => self.handle_warning(message),
            MessageKind::Error => self.handle_error(message)?,
            MessageKind::Other => self.handle_other(message),
        }

        if let Some(id) = &message.id {
            self.processed
                .write()
                .expect("poisoned processed-message lock")
                .insert(id.clone(), message.clone());
        }
        counter!("courier_consumer_messages_processed_total").increment(1);
        Ok(())
    }

    fn handle_info(&self, message: &Message) {
        info!(content = %message.content, "INFO message");
    }

    fn handle_warning(&self, message: &Message) {
        warn!(content = %message.content, "WARNING message");
    }

    fn handle_error(&self, message: &Message) -> Result<(), PipelineError> {
        error!(content = %message.content, "ERROR message");
        // An ordinary dispatch failure for the retry and recovery paths,
        // not a crash
        if message.content.contains(FATAL_MARKER) {
            return Err(PipelineError::Handler(format!(
                "fatal marker in message {}",
                message.id.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(())
    }

    fn handle_other(&self, message: &Message) {
        info!(
            message_type = message.message_type.as_deref().unwrap_or(""),
            content = %message.content,
            "message with unmapped type"
        );
    }

    pub fn processed_count(&self) -> usize {
        self.processed
            .read()
            .expect("poisoned processed-message lock")
            .len()
    }

    pub fn processed_message(&self, id: &str) -> Option<Message> {
        self.processed
            .read()
            .expect("poisoned processed-message lock")
            .get(id)
            .cloned()
    }
}
