//! The normalized message unit exchanged between connectors and the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Message
// ============================================================================

/// Direction of a message relative to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Who sent a message on the platform side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Platform-scoped user identifier.
    pub id: String,
    /// Display name, if the platform provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// One piece of message content. A message carries an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// A reference to media hosted by the platform; the gateway never inlines
    /// payload bytes into the message record.
    Media { url: String, mime_type: String },
}

/// The normalized unit of conversation content.
///
/// Immutable after creation. `seq` is the causal-order sequence number within
/// the conversation, assigned by the connector at normalization time, starting
/// at 1 and strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id, used for deduplication across connector retries.
    pub id: String,
    pub conversation_id: String,
    pub channel_id: String,
    pub direction: Direction,
    pub sender: Sender,
    pub parts: Vec<ContentPart>,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
}

impl Message {
    /// Build an inbound text message.
    pub fn inbound_text(
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender: Sender,
        text: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            conversation_id: conversation_id.into(),
            channel_id: channel_id.into(),
            direction: Direction::Inbound,
            sender,
            parts: vec![ContentPart::Text { text: text.into() }],
            timestamp: Utc::now(),
            seq,
        }
    }

    /// Build an outbound text message (a gateway reply).
    pub fn outbound_text(
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            conversation_id: conversation_id.into(),
            channel_id: channel_id.into(),
            direction: Direction::Outbound,
            sender: Sender {
                id: "agent".to_string(),
                display_name: None,
            },
            parts: vec![ContentPart::Text { text: text.into() }],
            timestamp: Utc::now(),
            seq,
        }
    }

    /// Concatenated text content of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Media { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// DeliveryReceipt
// ============================================================================

/// Returned by a connector after a successful outbound delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// The gateway-side message id that was delivered.
    pub message_id: String,
    /// Platform-assigned id for the delivered message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_text_fields() {
        let sender = Sender {
            id: "u1".to_string(),
            display_name: Some("Ada".to_string()),
        };
        let msg = Message::inbound_text("tg:acct", "conv-9", sender, "hello", 3);
        assert_eq!(msg.direction, Direction::Inbound);
        assert_eq!(msg.seq, 3);
        assert_eq!(msg.text(), "hello");
        assert_eq!(msg.id.len(), 26); // ULID
    }

    #[test]
    fn text_skips_media_parts() {
        let mut msg = Message::inbound_text(
            "c",
            "v",
            Sender {
                id: "u".to_string(),
                display_name: None,
            },
            "caption",
            1,
        );
        msg.parts.push(ContentPart::Media {
            url: "https://cdn.example/img.png".to_string(),
            mime_type: "image/png".to_string(),
        });
        assert_eq!(msg.text(), "caption");
    }

    #[test]
    fn message_serde_roundtrip() {
        let msg = Message::inbound_text(
            "ch",
            "conv",
            Sender {
                id: "u".to_string(),
                display_name: None,
            },
            "hi",
            1,
        );
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }
}
