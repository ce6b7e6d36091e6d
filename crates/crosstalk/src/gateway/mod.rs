//! Runtime assembly.
//!
//! Wires the subsystems together: connection registry → inbound pump →
//! router → conversation queues → orchestrator → back out through the
//! originating connector or the HTTP façade. One [`Gateway`] owns the pump
//! tasks and coordinates graceful shutdown; no error in a single connection,
//! session, or tool invocation brings it down.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crosstalk_connector_protocol::{ConnectorCommand, Message, Sender};

use crate::agent::{
    Orchestrator, OrchestratorDeps, ProviderRegistry, RunChunk, ScriptedProvider,
};
use crate::channel::{
    ChannelId, ConnectionRegistry, Credentials, LoopbackFactory, LoopbackHandle, PluginError,
    PluginRegistry,
};
use crate::config::Config;
use crate::queue::{BackpressureSignal, QueueManager};
use crate::router::{Router, RouteOutcome, RoutingError, RoutingTable};
use crate::session::SessionStore;
use crate::tools::ToolExecutor;

const INBOUND_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 256;
const BACKPRESSURE_BUFFER: usize = 64;
const API_CHUNK_BUFFER: usize = 64;

/// Identity attached to API-originated messages.
const API_SENDER_ID: &str = "api-client";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Storage(#[from] crate::session::StorageError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Registry(#[from] crate::channel::RegistryError),
}

/// Why an API submission produced no run.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no routing rule matches channel '{0}'")]
    NoRoute(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

// ============================================================================
// Gateway
// ============================================================================

/// A run started on behalf of an API client.
pub struct ApiRun {
    /// Incremental run output, ending with a completion or error chunk.
    pub chunks: mpsc::Receiver<RunChunk>,
    /// Cancelling this token stops the run and its tool invocations.
    pub cancel: CancellationToken,
}

pub struct Gateway {
    pub sessions: SessionStore,
    pub registry: ConnectionRegistry,
    pub router: Arc<Router>,
    pub orchestrator: Arc<Orchestrator>,
    pub plugins: PluginRegistry,
    pub providers: ProviderRegistry,
    queues: QueueManager,
    /// The built-in loopback platform, kept for demo and test wiring.
    loopback: LoopbackFactory,
    /// Per-conversation sequence counters for API-originated messages.
    api_seq: DashMap<String, u64>,
    shutdown_token: CancellationToken,
}

impl Gateway {
    /// Assemble the runtime from configuration. Fails only on startup
    /// problems (storage path, routing table); everything later is contained.
    pub async fn new(config: &Config) -> Result<Arc<Self>, GatewayError> {
        let sessions = SessionStore::open(&config.storage.sessions_path).await?;
        let table = RoutingTable::compile(&config.routing)?;

        let providers = ProviderRegistry::new();
        providers.register("default", Arc::new(ScriptedProvider::new()));

        let executor = Arc::new(ToolExecutor::new(&config.tools));

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (backpressure_tx, backpressure_rx) = mpsc::channel(BACKPRESSURE_BUFFER);

        let registry = ConnectionRegistry::new(inbound_tx, config.backoff, config.heartbeat);

        let orchestrator = Orchestrator::new(OrchestratorDeps {
            sessions: sessions.clone(),
            providers: providers.clone(),
            executor,
            retry: config.provider,
            tools: config.tools.clone(),
            outbound: outbound_tx,
        });

        let queues = QueueManager::new(orchestrator.clone(), config.queues.clone(), backpressure_tx);
        let router = Arc::new(Router::new(
            table,
            &config.dedup,
            sessions.clone(),
            queues.clone(),
        ));

        let plugins = PluginRegistry::new();
        let loopback = LoopbackFactory::default();
        plugins.register(Arc::new(loopback.clone()))?;

        let gateway = Arc::new(Self {
            sessions,
            registry,
            router,
            orchestrator,
            plugins,
            providers,
            queues,
            loopback,
            api_seq: DashMap::new(),
            shutdown_token: CancellationToken::new(),
        });

        gateway.spawn_pumps(inbound_rx, outbound_rx, backpressure_rx);
        gateway.register_configured_channels(config)?;
        Ok(gateway)
    }

    /// Open every channel named in the configuration.
    fn register_configured_channels(&self, config: &Config) -> Result<(), GatewayError> {
        for channel_config in &config.channels {
            let credentials = Credentials {
                token: channel_config.token.clone(),
            };
            let (channel, connector) = self.plugins.create(
                &channel_config.platform,
                &channel_config.account,
                &credentials,
            )?;
            self.registry.register(channel, connector, credentials)?;
        }
        Ok(())
    }

    fn spawn_pumps(
        self: &Arc<Self>,
        mut inbound_rx: mpsc::Receiver<Message>,
        mut outbound_rx: mpsc::Receiver<Message>,
        mut backpressure_rx: mpsc::Receiver<BackpressureSignal>,
    ) {
        self.queues.spawn_gc();

        // Inbound: connector traffic into the router.
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = gateway.shutdown_token.cancelled() => return,
                    message = inbound_rx.recv() => match message {
                        Some(message) => message,
                        None => return,
                    },
                };
                if let Err(e) = gateway
                    .router
                    .route(message, None, false, CancellationToken::new())
                    .await
                {
                    warn!(error = %e, "Failed to route inbound message");
                }
            }
        });

        // Outbound: completed run replies back through their channel.
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = gateway.shutdown_token.cancelled() => return,
                    message = outbound_rx.recv() => match message {
                        Some(message) => message,
                        None => return,
                    },
                };
                let channel_id = ChannelId::from_raw(message.channel_id.clone());
                if let Err(e) = gateway.registry.send(&channel_id, message).await {
                    warn!(channel = %channel_id, error = %e, "Outbound delivery failed");
                }
            }
        });

        // Backpressure: queue overflow pushes back on the originating
        // connector.
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = gateway.shutdown_token.cancelled() => return,
                    signal = backpressure_rx.recv() => match signal {
                        Some(signal) => signal,
                        None => return,
                    },
                };
                debug!(
                    channel = %signal.channel_id,
                    conversation = %signal.conversation_id,
                    "Signalling backpressure upstream"
                );
                let channel_id = ChannelId::from_raw(signal.channel_id.clone());
                gateway
                    .registry
                    .notify(
                        &channel_id,
                        ConnectorCommand::Backpressure {
                            conversation_id: signal.conversation_id,
                        },
                    )
                    .await;
            }
        });
    }

    // ========================================================================
    // API entry point
    // ========================================================================

    /// Submit an API-originated message, starting or joining a run.
    ///
    /// API messages are critical (never dropped by overflow handling) and
    /// carry a chunk stream back to the waiting client.
    pub async fn submit_api_message(
        &self,
        channel_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> Result<ApiRun, SubmitError> {
        let seq = self.next_api_seq(channel_id, conversation_id).await;
        let message = Message::inbound_text(
            channel_id,
            conversation_id,
            Sender {
                id: API_SENDER_ID.to_string(),
                display_name: None,
            },
            content,
            seq,
        );

        let (chunk_tx, chunk_rx) = mpsc::channel(API_CHUNK_BUFFER);
        let cancel = CancellationToken::new();
        let outcome = self
            .router
            .route(message, Some(chunk_tx), true, cancel.clone())
            .await?;
        match outcome {
            RouteOutcome::DeadLettered => Err(SubmitError::NoRoute(channel_id.to_string())),
            RouteOutcome::Admitted(_) | RouteOutcome::Duplicate => Ok(ApiRun {
                chunks: chunk_rx,
                cancel,
            }),
        }
    }

    /// Next strictly-increasing sequence number for an API conversation,
    /// seeded from session history so restarts continue rather than reset.
    async fn next_api_seq(&self, channel_id: &str, conversation_id: &str) -> u64 {
        let key = format!("{}|{}", channel_id, conversation_id);
        if !self.api_seq.contains_key(&key) {
            let last = self.sessions.last_seq(channel_id, conversation_id).await;
            self.api_seq.entry(key.clone()).or_insert(last);
        }
        let mut entry = self.api_seq.entry(key).or_insert(0);
        *entry += 1;
        *entry
    }

    /// The platform-side handle of a configured loopback channel.
    pub async fn loopback_handle(&self, account: &str) -> Option<LoopbackHandle> {
        self.loopback.take_handle(account).await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Graceful shutdown: stop pumps, cancel supervisors and live runs.
    pub fn shutdown(&self) {
        info!("Gateway shutting down");
        self.shutdown_token.cancel();
        self.registry.shutdown();
        self.orchestrator.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
