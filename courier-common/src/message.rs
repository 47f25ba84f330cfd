use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message type written by the recovery path for records that failed dispatch.
pub const RECOVERY_TYPE: &str = "RECOVERY";
/// Message type written back to the originator after successful processing.
pub const FEEDBACK_TYPE: &str = "FEEDBACK";
/// Messages of this type get a feedback message published once processed.
pub const REQUIRES_FEEDBACK_TYPE: &str = "REQUIRES_FEEDBACK";

/// The unit of data flowing through both channels. Immutable once sent:
/// feedback and recovery variants are new values, never mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, assigned by the publisher before the first
    /// transmission attempt if the producer did not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    /// Free-form category tag, dispatched on case-insensitively.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Closed dispatch enumeration derived from the free-form type tag.
/// Case is normalized once at this boundary, unknown tags land on the
/// default arm instead of falling through an open string match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Warning,
    Error,
    Other,
}

impl Message {
    pub fn new(content: impl Into<String>, message_type: impl Into<String>) -> Self {
        Message {
            id: None,
            content: content.into(),
            message_type: Some(message_type.into()),
            timestamp: None,
            source: None,
            metadata: HashMap::new(),
        }
    }

    /// A missing type tag is treated as INFO, matching the primary channel's
    /// dominant traffic.
    pub fn kind(&self) -> MessageKind {
        let Some(tag) = self.message_type.as_deref() else {
            return MessageKind::Info;
        };
        match tag.to_ascii_uppercase().as_str() {
            "INFO" => MessageKind::Info,
            "WARNING" => MessageKind::Warning,
            "ERROR" => MessageKind::Error,
            _ => MessageKind::Other,
        }
    }

    pub fn requires_feedback(&self) -> bool {
        self.message_type
            .as_deref()
            .is_some_and(|tag| tag.eq_ignore_ascii_case(REQUIRES_FEEDBACK_TYPE))
    }

    /// Assigns an id and creation timestamp if the producer left them out,
    /// and returns the id. Must run before the first transmission attempt so
    /// that every retry of the same logical send shares one idempotency key.
    pub fn ensure_identity(&mut self) -> String {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
        self.id
            .get_or_insert_with(|| Uuid::now_v7().to_string())
            .clone()
    }

    /// Builds the status message published to the feedback channel after
    /// `original` was successfully processed.
    pub fn feedback_for(original: &Message) -> Message {
        let original_id = original.id.clone().unwrap_or_else(|| "unknown".to_string());
        let now = Utc::now();
        Message {
            id: Some(Uuid::now_v7().to_string()),
            content: format!("Feedback for message: {original_id}"),
            message_type: Some(FEEDBACK_TYPE.to_string()),
            timestamp: Some(now),
            source: Some("consumer-service".to_string()),
            metadata: HashMap::from([
                ("originalMessageId".to_string(), original_id),
                ("processingTime".to_string(), now.to_rfc3339()),
            ]),
        }
    }

    /// Builds the recovery message published to the feedback channel for a
    /// record that failed dispatch, carrying the source envelope coordinates
    /// so the originator can locate the failure.
    pub fn recovery_for(original: &Message, topic: &str, partition: i32, offset: i64) -> Message {
        let original_id = original.id.clone().unwrap_or_else(|| "unknown".to_string());
        let now = Utc::now();
        Message {
            id: Some(format!("recovery-{original_id}")),
            content: format!("Recovery for: {}", original.content),
            message_type: Some(RECOVERY_TYPE.to_string()),
            timestamp: Some(now),
            source: Some("error-recovery-service".to_string()),
            metadata: HashMap::from([
                ("originalMessageId".to_string(), original_id),
                ("failureTimestamp".to_string(), now.to_rfc3339()),
                ("topic".to_string(), topic.to_string()),
                ("partition".to_string(), partition.to_string()),
                ("offset".to_string(), offset.to_string()),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use chrono::TimeZone;

    fn populated_message() -> Message {
        Message {
            id: Some("m-42".to_string()),
            content: "disk usage at 93%".to_string(),
            message_type: Some("WARNING".to_string()),
            timestamp: Some(Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 12).unwrap()),
            source: Some("node-exporter".to_string()),
            metadata: HashMap::from([
                ("host".to_string(), "worker-3".to_string()),
                ("mount".to_string(), "/data".to_string()),
            ]),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let message = populated_message();
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(message, decoded);

        // The tag is written as "type" on the wire
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "WARNING");

        // Re-encoding the decoded value yields the same document
        assert_json_eq!(value, serde_json::to_value(&decoded).unwrap());
    }

    #[test]
    fn decodes_sparse_payloads() {
        let decoded: Message = serde_json::from_str(r#"{"content": "hi"}"#).unwrap();
        assert_eq!(decoded.content, "hi");
        assert_eq!(decoded.id, None);
        assert_eq!(decoded.kind(), MessageKind::Info);
        assert!(decoded.metadata.is_empty());
    }

    #[test]
    fn kind_dispatch_is_case_insensitive_with_default_arm() {
        assert_eq!(Message::new("x", "error").kind(), MessageKind::Error);
        assert_eq!(Message::new("x", "Warning").kind(), MessageKind::Warning);
        assert_eq!(Message::new("x", "INFO").kind(), MessageKind::Info);
        assert_eq!(Message::new("x", "AUDIT").kind(), MessageKind::Other);
    }

    #[test]
    fn ensure_identity_is_stable_across_calls() {
        let mut message = Message::new("hello", "INFO");
        let id = message.ensure_identity();
        assert_eq!(message.id.as_deref(), Some(id.as_str()));
        assert!(message.timestamp.is_some());
        let timestamp = message.timestamp;

        // A retried send must keep the same idempotency key
        assert_eq!(message.ensure_identity(), id);
        assert_eq!(message.timestamp, timestamp);
    }

    #[test]
    fn recovery_message_links_back_to_the_original() {
        let original = populated_message();
        let recovery = Message::recovery_for(&original, "demo-topic", 2, 1337);

        assert_eq!(recovery.id.as_deref(), Some("recovery-m-42"));
        assert_eq!(recovery.message_type.as_deref(), Some(RECOVERY_TYPE));
        assert_eq!(recovery.content, "Recovery for: disk usage at 93%");
        assert_eq!(
            recovery.metadata.get("originalMessageId").map(String::as_str),
            Some("m-42")
        );
        assert_eq!(recovery.metadata.get("topic").map(String::as_str), Some("demo-topic"));
        assert_eq!(recovery.metadata.get("partition").map(String::as_str), Some("2"));
        assert_eq!(recovery.metadata.get("offset").map(String::as_str), Some("1337"));
        assert!(recovery.metadata.contains_key("failureTimestamp"));
    }

    #[test]
    fn feedback_message_references_the_original_id() {
        let original = populated_message();
        let feedback = Message::feedback_for(&original);

        assert_eq!(feedback.message_type.as_deref(), Some(FEEDBACK_TYPE));
        assert_ne!(feedback.id, original.id);
        assert_eq!(
            feedback.metadata.get("originalMessageId").map(String::as_str),
            Some("m-42")
        );
    }

    #[test]
    fn requires_feedback_tag_is_case_insensitive() {
        assert!(Message::new("x", "requires_feedback").requires_feedback());
        assert!(!Message::new("x", "INFO").requires_feedback());
    }
}
