//! In-process loopback connector.
//!
//! Backed by tokio channels instead of a network link, like a built-in
//! gateway. Used by the runtime tests and as a demo channel: the paired
//! [`LoopbackHandle`] plays the role of the remote platform, injecting events
//! and observing outbound deliveries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use crosstalk_connector_protocol::{
    Capabilities, ConnectorCommand, ConnectorEvent, DeliveryReceipt, Message, PlatformKind,
};

use super::connector::{Connector, ConnectorError, Credentials};
use super::plugin::{ConnectorFactory, PluginError};

const LOOPBACK_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// The platform side of a loopback pair.
#[derive(Clone)]
pub struct LoopbackHandle {
    events: mpsc::UnboundedSender<ConnectorEvent>,
    delivered: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    notices: Arc<Mutex<mpsc::UnboundedReceiver<ConnectorCommand>>>,
}

impl LoopbackHandle {
    /// Inject a raw connector event, as the platform would.
    pub fn emit(&self, event: ConnectorEvent) {
        let _ = self.events.send(event);
    }

    /// Inject an inbound message.
    pub fn deliver_inbound(&self, message: Message) {
        self.emit(ConnectorEvent::MessageReceived { message });
    }

    /// Emit a liveness heartbeat.
    pub fn heartbeat(&self) {
        self.emit(ConnectorEvent::Heartbeat);
    }

    /// Close the platform side; the connector's event stream ends.
    pub fn close(&self) {
        self.emit(ConnectorEvent::Closed { detail: None });
    }

    /// Next message the gateway sent out through this channel.
    pub async fn next_outbound(&self) -> Option<Message> {
        self.delivered.lock().await.recv().await
    }

    /// Next advisory signal (typing, backpressure) the gateway pushed toward
    /// the platform.
    pub async fn next_notice(&self) -> Option<ConnectorCommand> {
        self.notices.lock().await.recv().await
    }
}

/// The connector side of a loopback pair.
pub struct LoopbackConnector {
    capabilities: Capabilities,
    events: mpsc::UnboundedReceiver<ConnectorEvent>,
    delivered: mpsc::UnboundedSender<Message>,
    notices: mpsc::UnboundedSender<ConnectorCommand>,
    connected: bool,
}

impl LoopbackConnector {
    /// Create a connector and the handle driving it.
    pub fn pair() -> (Self, LoopbackHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let connector = Self {
            capabilities: Capabilities::text_only("loopback", LOOPBACK_MAX_MESSAGE_BYTES),
            events: event_rx,
            delivered: delivered_tx,
            notices: notice_tx,
            connected: false,
        };
        let handle = LoopbackHandle {
            events: event_tx,
            delivered: Arc::new(Mutex::new(delivered_rx)),
            notices: Arc::new(Mutex::new(notice_rx)),
        };
        (connector, handle)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn connect(&mut self, credentials: &Credentials) -> Result<(), ConnectorError> {
        // "invalid" stands in for a platform-side credential rejection.
        if credentials.token.as_deref() == Some("invalid") {
            return Err(ConnectorError::Auth("loopback token rejected".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<DeliveryReceipt, ConnectorError> {
        if !self.connected {
            return Err(ConnectorError::Network("not connected".to_string()));
        }
        let body_len: usize = message.text().len();
        if body_len > self.capabilities.max_message_bytes {
            return Err(ConnectorError::Rejected(format!(
                "message of {} bytes exceeds platform limit {}",
                body_len, self.capabilities.max_message_bytes
            )));
        }
        self.delivered
            .send(message.clone())
            .map_err(|_| ConnectorError::Delivery("loopback peer gone".to_string()))?;
        Ok(DeliveryReceipt {
            message_id: message.id.clone(),
            platform_message_id: None,
            delivered_at: Utc::now(),
        })
    }

    async fn recv(&mut self) -> Option<ConnectorEvent> {
        if !self.connected {
            return None;
        }
        match self.events.recv().await {
            Some(ConnectorEvent::Closed { detail }) => {
                self.connected = false;
                Some(ConnectorEvent::Closed { detail })
            }
            other => other,
        }
    }

    async fn notify(&mut self, command: &ConnectorCommand) {
        let _ = self.notices.send(command.clone());
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds loopback connectors and hands the platform-side handles out so a
/// host (tests, demos) can drive them.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    handles: Arc<Mutex<Vec<(String, LoopbackHandle)>>>,
}

impl LoopbackFactory {
    /// Take the handle created for an account, if any.
    pub async fn take_handle(&self, account: &str) -> Option<LoopbackHandle> {
        let mut handles = self.handles.lock().await;
        let idx = handles.iter().position(|(a, _)| a == account)?;
        Some(handles.swap_remove(idx).1)
    }
}

impl ConnectorFactory for LoopbackFactory {
    fn platform(&self) -> PlatformKind {
        PlatformKind::new("loopback")
    }

    fn manifest(&self) -> Capabilities {
        Capabilities::text_only("loopback", LOOPBACK_MAX_MESSAGE_BYTES)
    }

    fn create(
        &self,
        account: &str,
        _credentials: &Credentials,
    ) -> Result<Box<dyn Connector>, PluginError> {
        let (connector, handle) = LoopbackConnector::pair();
        // blocking_lock is fine: create() is called from sync registration
        // paths and the lock is only ever held momentarily.
        self.handles
            .try_lock()
            .map_err(|_| PluginError::Construction("loopback factory busy".to_string()))?
            .push((account.to_string(), handle));
        Ok(Box::new(connector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosstalk_connector_protocol::Sender;

    #[tokio::test]
    async fn connect_send_roundtrip() {
        let (mut connector, handle) = LoopbackConnector::pair();
        connector.connect(&Credentials::default()).await.unwrap();

        let msg = Message::outbound_text("loopback:demo", "conv-1", "hi there", 1);
        let receipt = connector.send(&msg).await.unwrap();
        assert_eq!(receipt.message_id, msg.id);

        let delivered = handle.next_outbound().await.unwrap();
        assert_eq!(delivered.text(), "hi there");
    }

    #[tokio::test]
    async fn recv_ends_after_close() {
        let (mut connector, handle) = LoopbackConnector::pair();
        connector.connect(&Credentials::default()).await.unwrap();

        handle.deliver_inbound(Message::inbound_text(
            "loopback:demo",
            "conv-1",
            Sender {
                id: "u1".to_string(),
                display_name: None,
            },
            "hello",
            1,
        ));
        handle.close();

        assert!(matches!(
            connector.recv().await,
            Some(ConnectorEvent::MessageReceived { .. })
        ));
        assert!(matches!(
            connector.recv().await,
            Some(ConnectorEvent::Closed { .. })
        ));
        // Not restartable: the stream stays closed until connect() again.
        assert!(connector.recv().await.is_none());
    }

    #[tokio::test]
    async fn invalid_token_is_auth_error() {
        let (mut connector, _handle) = LoopbackConnector::pair();
        let err = connector
            .connect(&Credentials {
                token: Some("invalid".to_string()),
            })
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let (mut connector, _handle) = LoopbackConnector::pair();
        connector.connect(&Credentials::default()).await.unwrap();

        let big = "x".repeat(LOOPBACK_MAX_MESSAGE_BYTES + 1);
        let msg = Message::outbound_text("loopback:demo", "conv-1", big, 1);
        let err = connector.send(&msg).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Rejected(_)));
    }
}
