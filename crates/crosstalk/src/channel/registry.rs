//! Connection registry.
//!
//! Owns the lifecycle of every registered channel. Each channel gets one
//! supervisor task that exclusively owns its connector and drives the state
//! machine:
//!
//! `Disconnected → Connecting → Connected → Degraded → Disconnected`, with a
//! terminal `Closed` on explicit deregistration or a permanent auth failure.
//!
//! Transient failures reconnect with exponential backoff (full jitter,
//! capped, unbounded retries). Missed heartbeats degrade the connection
//! first; after the configured number of consecutive misses the link is torn
//! down. State transitions are broadcast for observability.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crosstalk_connector_protocol::{
    ConnectorCommand, ConnectorEvent, ContentPart, DeliveryReceipt, Message,
};

use super::backoff::Backoff;
use super::connector::{Channel, ChannelId, Connector, ConnectorError, Credentials};
use crate::config::{BackoffConfig, HeartbeatConfig};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;

// ============================================================================
// Public types
// ============================================================================

/// Lifecycle state of one channel's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub channel_id: ChannelId,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_activity: DateTime<Utc>,
    pub backoff_deadline: Option<DateTime<Utc>>,
}

/// One observed state transition, published on the registry event stream.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub channel_id: ChannelId,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("channel '{0}' is already registered")]
    DuplicateChannel(ChannelId),

    #[error("channel '{0}' is not registered")]
    UnknownChannel(ChannelId),
}

/// Failures delivering an outbound message through the registry.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("channel is not registered")]
    UnknownChannel,

    #[error("channel is {0}, traffic is paused")]
    NotConnected(ConnectionState),

    #[error("message permanently rejected: {0}")]
    Rejected(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("channel supervisor is gone")]
    SupervisorGone,
}

enum ChannelCommand {
    Send {
        message: Message,
        reply: oneshot::Sender<Result<DeliveryReceipt, SendError>>,
    },
    Notify(ConnectorCommand),
}

struct Entry {
    channel: Channel,
    snapshot: ConnectionSnapshot,
    commands: mpsc::Sender<ChannelCommand>,
    cancel: CancellationToken,
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

#[derive(Clone)]
pub struct ConnectionRegistry {
    entries: Arc<DashMap<String, Entry>>,
    events: broadcast::Sender<StateTransition>,
    inbound: mpsc::Sender<Message>,
    backoff_cfg: BackoffConfig,
    heartbeat_cfg: HeartbeatConfig,
}

impl ConnectionRegistry {
    /// Create a registry that forwards normalized inbound messages to `inbound`.
    pub fn new(
        inbound: mpsc::Sender<Message>,
        backoff_cfg: BackoffConfig,
        heartbeat_cfg: HeartbeatConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            entries: Arc::new(DashMap::new()),
            events,
            inbound,
            backoff_cfg,
            heartbeat_cfg,
        }
    }

    /// Register a channel and start supervising its connection.
    pub fn register(
        &self,
        channel: Channel,
        connector: Box<dyn Connector>,
        credentials: Credentials,
    ) -> Result<(), RegistryError> {
        let key = channel.id.as_str().to_string();
        if self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateChannel(channel.id.clone()));
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();
        let snapshot = ConnectionSnapshot {
            channel_id: channel.id.clone(),
            state: ConnectionState::Disconnected,
            retry_count: 0,
            last_activity: Utc::now(),
            backoff_deadline: None,
        };

        info!(channel = %channel.id, platform = %channel.platform, "Registered channel");
        self.entries.insert(
            key,
            Entry {
                channel: channel.clone(),
                snapshot,
                commands: command_tx,
                cancel: cancel.clone(),
            },
        );

        let supervisor = Supervisor {
            channel_id: channel.id,
            connector,
            credentials,
            commands: command_rx,
            cancel,
            entries: self.entries.clone(),
            events: self.events.clone(),
            inbound: self.inbound.clone(),
            backoff: Backoff::new(self.backoff_cfg),
            heartbeat: self.heartbeat_cfg,
            state: ConnectionState::Disconnected,
        };
        tokio::spawn(supervisor.run());
        Ok(())
    }

    /// Close a channel's connection and remove it.
    pub fn deregister(&self, channel_id: &ChannelId) -> Result<(), RegistryError> {
        let (_, entry) = self
            .entries
            .remove(channel_id.as_str())
            .ok_or_else(|| RegistryError::UnknownChannel(channel_id.clone()))?;
        entry.cancel.cancel();
        info!(channel = %channel_id, "Deregistered channel");
        Ok(())
    }

    /// Point-in-time snapshot of one connection.
    pub fn status(&self, channel_id: &ChannelId) -> Option<ConnectionSnapshot> {
        self.entries
            .get(channel_id.as_str())
            .map(|e| e.snapshot.clone())
    }

    /// Subscribe to the state-transition event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }

    /// Deliver an outbound message through a channel.
    ///
    /// Traffic is paused unless the connection is `Connected`; callers see
    /// [`SendError::NotConnected`] and decide whether to retry. Messages the
    /// channel's capability manifest rules out are rejected here, before the
    /// connector ever sees them.
    pub async fn send(
        &self,
        channel_id: &ChannelId,
        message: Message,
    ) -> Result<DeliveryReceipt, SendError> {
        let commands = {
            let entry = self
                .entries
                .get(channel_id.as_str())
                .ok_or(SendError::UnknownChannel)?;
            if entry.snapshot.state != ConnectionState::Connected {
                return Err(SendError::NotConnected(entry.snapshot.state));
            }

            let caps = &entry.channel.capabilities;
            let body_bytes = message.text().len();
            if body_bytes > caps.max_message_bytes {
                return Err(SendError::Rejected(format!(
                    "message of {} bytes exceeds the platform limit of {}",
                    body_bytes, caps.max_message_bytes
                )));
            }
            if !caps.supports_media
                && message
                    .parts
                    .iter()
                    .any(|part| matches!(part, ContentPart::Media { .. }))
            {
                return Err(SendError::Rejected(
                    "platform does not accept media content".to_string(),
                ));
            }

            entry.commands.clone()
            // DashMap Ref dropped here, before any await
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(ChannelCommand::Send {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SendError::SupervisorGone)?;
        reply_rx.await.map_err(|_| SendError::SupervisorGone)?
    }

    /// Push an advisory signal (typing indicator, backpressure) toward a
    /// channel's platform. Best effort: dropped unless the link is up.
    pub async fn notify(&self, channel_id: &ChannelId, command: ConnectorCommand) {
        let commands = {
            let Some(entry) = self.entries.get(channel_id.as_str()) else {
                return;
            };
            if !matches!(
                entry.snapshot.state,
                ConnectionState::Connected | ConnectionState::Degraded
            ) {
                debug!(channel = %channel_id, "Link down, advisory signal dropped");
                return;
            }
            if matches!(command, ConnectorCommand::Typing { .. })
                && !entry.channel.capabilities.supports_typing_indicator
            {
                debug!(channel = %channel_id, "Platform lacks typing indicators, advisory dropped");
                return;
            }
            entry.commands.clone()
        };
        let _ = commands.send(ChannelCommand::Notify(command)).await;
    }

    /// Cancel every supervisor. Used at shutdown.
    pub fn shutdown(&self) {
        let mut cancelled = 0u32;
        for entry in self.entries.iter() {
            entry.cancel.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            info!(cancelled, "Sent cancel to channel supervisors");
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

enum ServeOutcome {
    /// Deregistration or shutdown.
    Cancelled,
    /// Permanent credential failure; channel is closed, no retry.
    AuthClosed,
    /// The link dropped; reconnect after backoff.
    LinkLost,
}

struct Supervisor {
    channel_id: ChannelId,
    connector: Box<dyn Connector>,
    credentials: Credentials,
    commands: mpsc::Receiver<ChannelCommand>,
    cancel: CancellationToken,
    entries: Arc<DashMap<String, Entry>>,
    events: broadcast::Sender<StateTransition>,
    inbound: mpsc::Sender<Message>,
    backoff: Backoff,
    heartbeat: HeartbeatConfig,
    state: ConnectionState,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                self.connector.disconnect().await;
                self.transition(ConnectionState::Closed);
                return;
            }

            self.transition(ConnectionState::Connecting);
            match self.connector.connect(&self.credentials).await {
                Ok(()) => {}
                Err(e) if e.is_permanent() => {
                    self.alert_closed(&e.to_string());
                    self.transition(ConnectionState::Closed);
                    return;
                }
                Err(e) => {
                    warn!(channel = %self.channel_id, error = %e, "Connect attempt failed");
                    self.transition(ConnectionState::Disconnected);
                    if !self.sleep_backoff().await {
                        self.transition(ConnectionState::Closed);
                        return;
                    }
                    continue;
                }
            }

            match self.serve_connected().await {
                ServeOutcome::Cancelled => {
                    self.connector.disconnect().await;
                    self.transition(ConnectionState::Closed);
                    return;
                }
                ServeOutcome::AuthClosed => {
                    self.connector.disconnect().await;
                    self.transition(ConnectionState::Closed);
                    return;
                }
                ServeOutcome::LinkLost => {
                    self.connector.disconnect().await;
                    self.transition(ConnectionState::Disconnected);
                    if !self.sleep_backoff().await {
                        self.transition(ConnectionState::Closed);
                        return;
                    }
                }
            }
        }
    }

    /// Serve traffic while connected. Returns why the connected phase ended.
    async fn serve_connected(&mut self) -> ServeOutcome {
        self.transition(ConnectionState::Connected);
        let connected_at = Instant::now();
        let mut backoff_reset = false;
        let mut missed_heartbeats = 0u32;

        let hb_interval = Duration::from_secs(self.heartbeat.interval_seconds);
        let mut ticker = tokio::time::interval_at(Instant::now() + hb_interval, hb_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return ServeOutcome::Cancelled,

                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        // Registry entry dropped out from under us.
                        return ServeOutcome::Cancelled;
                    };
                    let (message, reply) = match cmd {
                        ChannelCommand::Send { message, reply } => (message, reply),
                        ChannelCommand::Notify(command) => {
                            self.connector.notify(&command).await;
                            continue;
                        }
                    };
                    match self.connector.send(&message).await {
                        Ok(receipt) => {
                            self.touch();
                            let _ = reply.send(Ok(receipt));
                        }
                        Err(ConnectorError::Rejected(reason)) => {
                            // Permanent for this message, not for the link.
                            let _ = reply.send(Err(SendError::Rejected(reason)));
                        }
                        Err(ConnectorError::Auth(reason)) => {
                            let _ = reply.send(Err(SendError::Delivery(reason.clone())));
                            self.alert_closed(&reason);
                            return ServeOutcome::AuthClosed;
                        }
                        Err(ConnectorError::Network(reason)) => {
                            let _ = reply.send(Err(SendError::Delivery(reason)));
                            return ServeOutcome::LinkLost;
                        }
                        Err(e) => {
                            // Transient send failure: keep the link, pause traffic.
                            let _ = reply.send(Err(SendError::Delivery(e.to_string())));
                            warn!(channel = %self.channel_id, error = %e, "Transient send failure, degrading");
                            self.transition(ConnectionState::Degraded);
                        }
                    }
                }

                event = self.connector.recv() => match event {
                    Some(ConnectorEvent::Connected) => self.touch(),
                    Some(ConnectorEvent::Heartbeat) => {
                        missed_heartbeats = 0;
                        ticker.reset();
                        self.touch();
                        if self.state == ConnectionState::Degraded {
                            self.transition(ConnectionState::Connected);
                        }
                        // One full heartbeat interval up counts as sustained.
                        if !backoff_reset && connected_at.elapsed() >= hb_interval {
                            self.backoff.reset();
                            self.reset_retry_count();
                            backoff_reset = true;
                        }
                    }
                    Some(ConnectorEvent::MessageReceived { message }) => {
                        self.touch();
                        debug!(
                            channel = %self.channel_id,
                            conversation = %message.conversation_id,
                            seq = message.seq,
                            "Inbound message"
                        );
                        if self.inbound.send(message).await.is_err() {
                            // Gateway is shutting down.
                            return ServeOutcome::Cancelled;
                        }
                    }
                    Some(ConnectorEvent::TransportError { code, detail }) => {
                        warn!(channel = %self.channel_id, code, detail, "Transport error, degrading");
                        self.transition(ConnectionState::Degraded);
                    }
                    Some(ConnectorEvent::AuthRejected { detail }) => {
                        self.alert_closed(&detail);
                        return ServeOutcome::AuthClosed;
                    }
                    Some(ConnectorEvent::Closed { detail }) => {
                        warn!(channel = %self.channel_id, detail = ?detail, "Platform closed connection");
                        return ServeOutcome::LinkLost;
                    }
                    None => return ServeOutcome::LinkLost,
                },

                _ = ticker.tick() => {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= self.heartbeat.misses_to_disconnect {
                        warn!(
                            channel = %self.channel_id,
                            missed = missed_heartbeats,
                            "Heartbeats lost, disconnecting"
                        );
                        return ServeOutcome::LinkLost;
                    }
                    if self.state == ConnectionState::Connected {
                        warn!(channel = %self.channel_id, "Missed heartbeat, degrading");
                        self.transition(ConnectionState::Degraded);
                    }
                }
            }
        }
    }

    /// Sleep out the next backoff delay. Returns `false` if cancelled.
    async fn sleep_backoff(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        if let Some(mut entry) = self.entries.get_mut(self.channel_id.as_str()) {
            entry.snapshot.retry_count = self.backoff.attempt();
            entry.snapshot.backoff_deadline =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        }
        debug!(
            channel = %self.channel_id,
            delay_ms = delay.as_millis() as u64,
            attempt = self.backoff.attempt(),
            "Backing off before reconnect"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => {
                if let Some(mut entry) = self.entries.get_mut(self.channel_id.as_str()) {
                    entry.snapshot.backoff_deadline = None;
                }
                true
            }
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        if let Some(mut entry) = self.entries.get_mut(self.channel_id.as_str()) {
            entry.snapshot.state = to;
        }
        let _ = self.events.send(StateTransition {
            channel_id: self.channel_id.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    fn touch(&self) {
        if let Some(mut entry) = self.entries.get_mut(self.channel_id.as_str()) {
            entry.snapshot.last_activity = Utc::now();
        }
    }

    fn reset_retry_count(&self) {
        if let Some(mut entry) = self.entries.get_mut(self.channel_id.as_str()) {
            entry.snapshot.retry_count = 0;
        }
    }

    /// Operator-visible alert for a permanent credential failure.
    fn alert_closed(&self, detail: &str) {
        error!(
            channel = %self.channel_id,
            detail,
            "Channel credentials rejected, closing channel permanently"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
