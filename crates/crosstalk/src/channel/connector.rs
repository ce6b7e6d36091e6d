//! The contract every channel connector implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crosstalk_connector_protocol::{
    Capabilities, ConnectorCommand, ConnectorEvent, DeliveryReceipt, Message, PlatformKind,
};

// ============================================================================
// Channel identity
// ============================================================================

/// Identifies a platform + account pair, e.g. `telegram:bot-acct-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(platform: &PlatformKind, account: &str) -> Self {
        Self(format!("{}:{}", platform, account))
    }

    /// Wrap an already-formatted `platform:account` string, as carried on
    /// messages.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered platform + account pair. Immutable once registered; removed
/// only by explicit deregistration.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub platform: PlatformKind,
    pub account: String,
    pub capabilities: Capabilities,
}

impl Channel {
    pub fn new(platform: PlatformKind, account: impl Into<String>, capabilities: Capabilities) -> Self {
        let account = account.into();
        Self {
            id: ChannelId::new(&platform, &account),
            platform,
            account,
            capabilities,
        }
    }
}

/// Opaque credential material handed to a connector at connect time.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
}

// ============================================================================
// ConnectorError
// ============================================================================

/// Failures reported by a connector.
///
/// `Auth` and `Rejected` are permanent; the registry closes the channel or
/// fails the delivery without retrying. Everything else is transient and
/// handled with backoff.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("message rejected by platform: {0}")]
    Rejected(String),

    #[error("malformed platform event: {0}")]
    Protocol(String),
}

impl ConnectorError {
    /// Permanent errors must not be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ConnectorError::Auth(_) | ConnectorError::Rejected(_))
    }
}

// ============================================================================
// Connector
// ============================================================================

/// One platform's wire protocol.
///
/// The connection registry owns each connector exclusively (one supervisor
/// task per channel), so methods take `&mut self` and implementations need no
/// internal locking.
///
/// `recv` yields a lazy, infinite sequence of events until the connection
/// closes (`None`). It is not restartable: after `None` the registry calls
/// `connect` again before polling events. Malformed platform events must be
/// dropped inside the connector with a logged reason, never surfaced as a
/// crash.
#[async_trait]
pub trait Connector: Send {
    /// The capability manifest this connector declared at load time.
    fn capabilities(&self) -> &Capabilities;

    /// Establish the platform link. Events then flow through [`recv`](Self::recv).
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), ConnectorError>;

    /// Deliver an outbound message.
    async fn send(&mut self, message: &Message) -> Result<DeliveryReceipt, ConnectorError>;

    /// Next normalized event, or `None` once the connection has closed.
    async fn recv(&mut self) -> Option<ConnectorEvent>;

    /// Best-effort advisory signal toward the platform (typing indicator,
    /// backpressure). Connectors without a platform equivalent ignore it.
    async fn notify(&mut self, _command: &ConnectorCommand) {}

    /// Tear down the platform link. Idempotent.
    async fn disconnect(&mut self);
}
