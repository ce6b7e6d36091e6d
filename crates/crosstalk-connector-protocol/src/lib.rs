//! Connector protocol types for Crosstalk.
//!
//! A channel connector bridges one messaging platform (chat app, voice, SMS)
//! to the gateway. Connectors can be compiled in or shipped as third-party
//! plugins; either way they speak this protocol:
//!
//! - [`ConnectorCommand`]: gateway → connector (send a message, typing, shutdown)
//! - [`ConnectorEvent`]: connector → gateway (message received, heartbeat, errors)
//!
//! Platform-native payloads are normalized into [`Message`] before they cross
//! this boundary; the gateway never sees raw platform events.

mod manifest;
mod message;

pub use manifest::{Capabilities, PlatformKind, RateLimitHint};
pub use message::{ContentPart, DeliveryReceipt, Direction, Message, Sender};

use serde::{Deserialize, Serialize};

// ============================================================================
// Commands (gateway → connector)
// ============================================================================

/// A command issued by the gateway to a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorCommand {
    /// Deliver an outbound message to the platform.
    SendMessage { message: Message },
    /// Show a typing indicator in the given conversation, if supported.
    Typing { conversation_id: String },
    /// The conversation's queue is saturated; the connector should slow its
    /// producers (platform-level flow control, read-receipt throttling, etc.).
    Backpressure { conversation_id: String },
    /// Disconnect and stop producing events. Idempotent.
    Shutdown,
}

// ============================================================================
// Events (connector → gateway)
// ============================================================================

/// An event produced by a connector for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorEvent {
    /// The platform link is established and traffic may flow.
    Connected,
    /// Periodic liveness signal. The registry marks the connection degraded
    /// when these stop arriving.
    Heartbeat,
    /// A normalized inbound message.
    MessageReceived { message: Message },
    /// A recoverable transport problem. The registry will back off and retry.
    TransportError { code: String, detail: String },
    /// Credentials were rejected. The registry closes the channel; no retry.
    AuthRejected { detail: String },
    /// The platform closed the link. The registry will back off and retry.
    Closed { detail: Option<String> },
}

// ============================================================================
// Error codes
// ============================================================================

/// Stable error codes carried in [`ConnectorEvent::TransportError`].
pub mod error_codes {
    /// The platform endpoint was unreachable.
    pub const NETWORK: &str = "network";
    /// The platform rate-limited the connector.
    pub const RATE_LIMITED: &str = "rate_limited";
    /// An outbound delivery failed but may succeed on retry.
    pub const DELIVERY: &str = "delivery";
    /// The platform permanently rejected an outbound message.
    pub const REJECTED: &str = "rejected";
    /// An inbound platform event could not be normalized and was dropped.
    pub const MALFORMED_EVENT: &str = "malformed_event";
}
