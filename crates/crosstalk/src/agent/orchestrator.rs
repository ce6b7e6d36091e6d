//! Agent run orchestration.
//!
//! Drives one [`AgentRun`] per session through its state machine: call the
//! provider over the session history, execute any requested tools, feed the
//! results back, repeat until the provider produces a final response.
//!
//! The at-most-one-non-terminal-run invariant is enforced structurally: the
//! orchestrator holds the session's exclusive processing lock for the whole
//! run, and a message arriving mid-run is steered into the live run as its
//! next input instead of spawning a second one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crosstalk_connector_protocol::Message;

use crate::config::{ProviderRetryConfig, ToolConfig};
use crate::queue::{ItemProcessor, QueueItem};
use crate::session::{SessionEventPayload, SessionStore, StorageError};
use crate::tools::{InvocationState, ToolExecutor};

use super::provider::{
    ProviderClient, ProviderError, ProviderEvent, ProviderRegistry, ToolDefinition, ToolRequest,
    Usage,
};
use super::{AgentRun, ChunkSender, InvocationRecord, RunChunk, RunState};

// ============================================================================
// Errors
// ============================================================================

/// Why a run did not complete.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no provider configured for profile '{0}'")]
    NoProvider(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("max tool iterations ({0}) exceeded")]
    MaxIterations(u32),

    #[error("run cancelled")]
    Cancelled,
}

// ============================================================================
// Run handles
// ============================================================================

/// Handle to a live run, kept in the active table while it is non-terminal.
pub struct RunHandle {
    pub run_id: String,
    cancel: CancellationToken,
    steering: mpsc::Sender<QueueItem>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct OrchestratorDeps {
    pub sessions: SessionStore,
    pub providers: ProviderRegistry,
    pub executor: Arc<ToolExecutor>,
    pub retry: ProviderRetryConfig,
    pub tools: ToolConfig,
    /// Completed connector-originated runs reply through here.
    pub outbound: mpsc::Sender<Message>,
}

pub struct Orchestrator {
    deps: OrchestratorDeps,
    /// Live runs by session id.
    active: DashMap<String, RunHandle>,
}

/// What one provider completion produced.
struct Completion {
    text: String,
    tool_requests: Vec<ToolRequest>,
    usage: Option<Usage>,
    cancelled: bool,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            active: DashMap::new(),
        })
    }

    /// Number of currently live runs.
    pub fn active_runs(&self) -> usize {
        self.active.len()
    }

    /// Cancel every live run. Each will reach `Cancelled` and archive itself.
    pub fn shutdown(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    // ========================================================================
    // Run lifecycle
    // ========================================================================

    async fn run_item(&self, item: QueueItem) {
        let session_id = item.session_id.clone();
        let lock = self.deps.sessions.processing_lock(&session_id);
        let _guard = lock.lock().await;

        // An item steered into a run during its teardown window is recovered
        // and run next under the same lock, never dropped.
        let mut pending = std::collections::VecDeque::from([item]);
        while let Some(item) = pending.pop_front() {
            let late = self.run_one(&session_id, item).await;
            pending.extend(late);
        }
    }

    async fn run_one(&self, session_id: &str, item: QueueItem) -> Vec<QueueItem> {
        let session_id = session_id.to_string();
        let cancel = item.cancel.clone();
        // Cancelled at teardown so per-client cancel forwarders do not
        // outlive the run.
        let run_done = CancellationToken::new();
        let (steer_tx, mut steer_rx) = mpsc::channel(8);
        let mut run = AgentRun::new(session_id.clone(), item.message.id.clone());
        self.active.insert(
            session_id.clone(),
            RunHandle {
                run_id: run.run_id.clone(),
                cancel: cancel.clone(),
                steering: steer_tx,
            },
        );
        info!(session = %session_id, run = %run.run_id, "Run started");

        let reply_to = if item.chunks.is_none() {
            Some((item.message.channel_id.clone(), item.message.conversation_id.clone(), item.message.seq))
        } else {
            None
        };
        let mut chunks = item.chunks.clone();

        let outcome = self
            .drive(&mut run, item, &mut steer_rx, &mut chunks, &run_done)
            .await;

        // Tear down steering before finalizing; anything the queue tries to
        // steer from here on is handed back and re-queued. A send that
        // already landed in the buffer is drained below and recovered.
        self.active.remove(&session_id);
        steer_rx.close();
        run_done.cancel();
        let mut late = Vec::new();
        while let Ok(item) = steer_rx.try_recv() {
            late.push(item);
        }

        run.ended_at = Some(Utc::now());
        match &outcome {
            Ok(()) => {
                run.state = RunState::Completed;
                emit(&chunks, RunChunk::Completed {
                    run_id: run.run_id.clone(),
                    usage: run.usage,
                })
                .await;
            }
            Err(RunError::Cancelled) => {
                // A cancelled client gets nothing further.
                run.state = RunState::Cancelled;
                info!(session = %session_id, run = %run.run_id, "Run cancelled");
            }
            Err(e) => {
                run.state = RunState::Failed;
                warn!(session = %session_id, run = %run.run_id, error = %e, "Run failed");
                let note = SessionEventPayload::ErrorNote {
                    run_id: Some(run.run_id.clone()),
                    message: e.to_string(),
                };
                if let Err(storage_err) = self.deps.sessions.append_event(&session_id, note).await {
                    warn!(error = %storage_err, "Failed to persist run error note");
                }
                emit(&chunks, RunChunk::Error {
                    message: e.to_string(),
                })
                .await;
            }
        }

        let archived = SessionEventPayload::RunArchived { run: run.clone() };
        if let Err(e) = self.deps.sessions.append_event(&session_id, archived).await {
            warn!(session = %session_id, error = %e, "Failed to archive run");
        }

        if run.state == RunState::Completed && !run.output.is_empty() {
            if let Some((channel_id, conversation_id, seq)) = reply_to {
                let reply = Message::outbound_text(&channel_id, &conversation_id, &run.output, seq);
                if self.deps.outbound.send(reply).await.is_err() {
                    warn!(session = %session_id, "Outbound channel closed, reply dropped");
                }
            }
        }
        late
    }

    /// The run state machine proper. Mutates `run` in place; the caller
    /// finalizes terminal state, archival, and the outbound reply.
    async fn drive(
        &self,
        run: &mut AgentRun,
        first: QueueItem,
        steer_rx: &mut mpsc::Receiver<QueueItem>,
        chunks: &mut Option<ChunkSender>,
        run_done: &CancellationToken,
    ) -> Result<(), RunError> {
        let cancel = first.cancel.clone();
        let profile = first.profile.clone();
        let provider = self
            .deps
            .providers
            .client_for(&profile)
            .ok_or_else(|| RunError::NoProvider(profile.clone()))?;
        let definitions = self.deps.executor.definitions();

        self.record_inbound(&run.session_id, &first.message).await?;
        drop(first);

        let mut iterations = 0u32;
        loop {
            // Messages steered in mid-run become the run's next input. The
            // latest item with a waiting client takes over the chunk stream.
            while let Ok(steered) = steer_rx.try_recv() {
                self.adopt_steered(&run.session_id, steered, &cancel, run_done, chunks)
                    .await?;
            }
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            iterations += 1;
            if iterations > self.deps.retry.max_tool_iterations {
                return Err(RunError::MaxIterations(self.deps.retry.max_tool_iterations));
            }
            run.state = RunState::Running;
            debug!(
                run = %run.run_id,
                iteration = iterations,
                "Run iteration"
            );

            let history = self.deps.sessions.history(&run.session_id).await?;
            let completion = self
                .complete_with_retry(provider.as_ref(), &history, &definitions, &cancel, chunks, run)
                .await?;
            if completion.cancelled {
                return Err(RunError::Cancelled);
            }
            if let Some(usage) = completion.usage {
                run.usage.get_or_insert_with(Usage::default).accumulate(&usage);
            }

            if completion.tool_requests.is_empty() {
                run.state = RunState::Responding;
                self.deps
                    .sessions
                    .append_event(
                        &run.session_id,
                        SessionEventPayload::AssistantMessage {
                            run_id: run.run_id.clone(),
                            content: completion.text,
                            usage: completion.usage,
                        },
                    )
                    .await?;
                // An input that slipped in while we were responding keeps
                // this run going rather than spawning a new one.
                if let Ok(steered) = steer_rx.try_recv() {
                    self.adopt_steered(&run.session_id, steered, &cancel, run_done, chunks)
                        .await?;
                    continue;
                }
                return Ok(());
            }

            // Interim text accompanying tool calls still belongs to history.
            if !completion.text.is_empty() {
                self.deps
                    .sessions
                    .append_event(
                        &run.session_id,
                        SessionEventPayload::AssistantMessage {
                            run_id: run.run_id.clone(),
                            content: completion.text,
                            usage: None,
                        },
                    )
                    .await?;
            }

            run.state = RunState::WaitingForTool;
            self.dispatch_tools(run, &completion.tool_requests, &cancel, chunks)
                .await?;
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
        }
    }

    /// One provider completion with bounded retry on retryable errors.
    async fn complete_with_retry(
        &self,
        provider: &dyn ProviderClient,
        history: &[crate::session::HistoryEntry],
        definitions: &[ToolDefinition],
        cancel: &CancellationToken,
        chunks: &Option<ChunkSender>,
        run: &mut AgentRun,
    ) -> Result<Completion, RunError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(Completion {
                    text: String::new(),
                    tool_requests: Vec::new(),
                    usage: None,
                    cancelled: true,
                });
            }

            let stream = match provider.complete(history, definitions).await {
                Ok(stream) => stream,
                Err(e) => {
                    if e.is_retryable() && attempt < self.deps.retry.max_retries {
                        attempt += 1;
                        let delay = self.retry_delay(&e, attempt);
                        warn!(
                            run = %run.run_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Provider call failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    return Err(RunError::Provider(e));
                }
            };

            match self.consume_stream(stream, cancel, chunks, run).await {
                Ok(completion) => return Ok(completion),
                Err((e, saw_output)) => {
                    // A completion that already produced output cannot be
                    // transparently replayed.
                    if e.is_retryable() && !saw_output && attempt < self.deps.retry.max_retries {
                        attempt += 1;
                        let delay = self.retry_delay(&e, attempt);
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    return Err(RunError::Provider(e));
                }
            }
        }
    }

    fn retry_delay(&self, error: &ProviderError, attempt: u32) -> std::time::Duration {
        if let ProviderError::RateLimited {
            retry_after: Some(seconds),
        } = error
        {
            return std::time::Duration::from_secs(*seconds);
        }
        std::time::Duration::from_millis(self.deps.retry.retry_backoff_ms * u64::from(attempt))
    }

    async fn consume_stream(
        &self,
        mut stream: super::ProviderStream,
        cancel: &CancellationToken,
        chunks: &Option<ChunkSender>,
        run: &mut AgentRun,
    ) -> Result<Completion, (ProviderError, bool)> {
        let mut completion = Completion {
            text: String::new(),
            tool_requests: Vec::new(),
            usage: None,
            cancelled: false,
        };

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    completion.cancelled = true;
                    return Ok(completion);
                }
                event = stream.next() => event,
            };
            match event {
                None => return Ok(completion),
                Some(Ok(ProviderEvent::TextDelta(delta))) => {
                    run.output.push_str(&delta);
                    completion.text.push_str(&delta);
                    emit(chunks, RunChunk::TextDelta { text: delta }).await;
                }
                Some(Ok(ProviderEvent::ToolRequests(requests))) => {
                    completion.tool_requests = requests;
                }
                Some(Ok(ProviderEvent::Done { usage })) => {
                    completion.usage = usage;
                    return Ok(completion);
                }
                Some(Err(e)) => {
                    let saw_output =
                        !completion.text.is_empty() || !completion.tool_requests.is_empty();
                    return Err((e, saw_output));
                }
            }
        }
    }

    /// Execute one batch of tool requests in parallel and record everything.
    async fn dispatch_tools(
        &self,
        run: &mut AgentRun,
        requests: &[ToolRequest],
        cancel: &CancellationToken,
        chunks: &Option<ChunkSender>,
    ) -> Result<(), RunError> {
        for request in requests {
            self.deps
                .sessions
                .append_event(
                    &run.session_id,
                    SessionEventPayload::ToolCall {
                        run_id: run.run_id.clone(),
                        invocation_id: request.invocation_id.clone(),
                        tool_name: request.tool_name.clone(),
                        arguments: request.arguments.clone(),
                    },
                )
                .await?;
            emit(chunks, RunChunk::ToolCall {
                invocation_id: request.invocation_id.clone(),
                tool_name: request.tool_name.clone(),
                state: InvocationState::Running,
            })
            .await;
        }

        let futures: Vec<_> = requests
            .iter()
            .map(|request| self.deps.executor.execute(request, cancel))
            .collect();
        let mut results = futures::future::join_all(futures).await;

        // A timed-out invocation gets exactly one more attempt when policy
        // allows it; every attempt stays on the run's record.
        if self.deps.tools.retry_on_timeout {
            for (index, request) in requests.iter().enumerate() {
                if results[index].state == InvocationState::TimedOut && !cancel.is_cancelled() {
                    debug!(tool = %request.tool_name, "Retrying timed-out invocation");
                    run.invocations.push(record_of(&results[index]));
                    results[index] = self.deps.executor.execute(request, cancel).await;
                }
            }
        }

        for invocation in &results {
            run.invocations.push(record_of(invocation));
            self.deps
                .sessions
                .append_event(
                    &run.session_id,
                    SessionEventPayload::ToolResult {
                        run_id: run.run_id.clone(),
                        invocation_id: invocation.invocation_id.clone(),
                        tool_name: invocation.tool_name.clone(),
                        success: invocation.succeeded(),
                        content: invocation.content.clone(),
                    },
                )
                .await?;
            emit(chunks, RunChunk::ToolCall {
                invocation_id: invocation.invocation_id.clone(),
                tool_name: invocation.tool_name.clone(),
                state: invocation.state,
            })
            .await;
        }
        Ok(())
    }

    /// Absorb a steered item into the live run: its message joins history,
    /// a waiting client takes over the chunk stream, and its cancel token
    /// gains authority over the run it just joined.
    async fn adopt_steered(
        &self,
        session_id: &str,
        steered: QueueItem,
        run_cancel: &CancellationToken,
        run_done: &CancellationToken,
        chunks: &mut Option<ChunkSender>,
    ) -> Result<(), StorageError> {
        if steered.chunks.is_some() {
            *chunks = steered.chunks.clone();
        }
        if steered.cancel.is_cancelled() {
            run_cancel.cancel();
        } else {
            let client = steered.cancel.clone();
            let run_cancel = run_cancel.clone();
            let run_done = run_done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = client.cancelled() => run_cancel.cancel(),
                    _ = run_done.cancelled() => {}
                }
            });
        }
        self.record_inbound(session_id, &steered.message).await
    }

    async fn record_inbound(&self, session_id: &str, message: &Message) -> Result<(), StorageError> {
        self.deps
            .sessions
            .append_event(
                session_id,
                SessionEventPayload::InboundMessage {
                    message: message.clone(),
                },
            )
            .await
    }
}

#[async_trait]
impl ItemProcessor for Orchestrator {
    async fn try_steer(&self, item: QueueItem) -> Option<QueueItem> {
        let steering = self
            .active
            .get(&item.session_id)
            .map(|handle| handle.steering.clone());
        match steering {
            Some(tx) => match tx.send(item).await {
                Ok(()) => None,
                Err(returned) => Some(returned.0),
            },
            None => Some(item),
        }
    }

    async fn process(&self, item: QueueItem) {
        self.run_item(item).await;
    }
}

async fn emit(chunks: &Option<ChunkSender>, chunk: RunChunk) {
    if let Some(tx) = chunks {
        // A departed consumer cancels via its token; a full or closed
        // channel must not stall the run's own state machine.
        let _ = tx.send(chunk).await;
    }
}

fn record_of(invocation: &crate::tools::ToolInvocation) -> InvocationRecord {
    InvocationRecord {
        invocation_id: invocation.invocation_id.clone(),
        tool_name: invocation.tool_name.clone(),
        state: invocation.state,
        started_at: invocation.started_at,
        ended_at: invocation.ended_at,
    }
}

// ============================================================================
// Tests
// ============================================================================
