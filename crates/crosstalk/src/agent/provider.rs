//! AI provider client contract.
//!
//! Concrete provider wire formats live outside the gateway; the orchestrator
//! only depends on this trait. A completion is a stream of typed events so
//! output can be forwarded incrementally.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::HistoryEntry;

// ============================================================================
// Types
// ============================================================================

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One tool the provider may ask the agent to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments, if the tool declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// One tool call requested by the provider within a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Provider-assigned call id, echoed back with the result.
    pub invocation_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Events produced by one completion.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// The provider wants these tools called before it can continue.
    ToolRequests(Vec<ToolRequest>),
    /// End of the completion.
    Done { usage: Option<Usage> },
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

// ============================================================================
// Errors
// ============================================================================

/// Errors a provider call can fail with.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Rate limited; retry after a backoff.
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    /// Credentials rejected. Not retryable.
    #[error("provider auth rejected: {0}")]
    Auth(String),

    /// Unrecoverable provider error. Fails the run.
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Whether the orchestrator should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

// ============================================================================
// Client contract
// ============================================================================

/// An AI provider backend.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;

    /// Run one completion over the session history.
    async fn complete(
        &self,
        history: &[HistoryEntry],
        tools: &[ToolDefinition],
    ) -> Result<ProviderStream, ProviderError>;
}

// ============================================================================
// Registry
// ============================================================================

/// Provider clients keyed by agent profile, with a `default` fallback.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: Arc<DashMap<String, Arc<dyn ProviderClient>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, profile: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.clients.insert(profile.into(), client);
    }

    /// Resolve the client for a profile, falling back to `default`.
    pub fn client_for(&self, profile: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients
            .get(profile)
            .or_else(|| self.clients.get("default"))
            .map(|entry| entry.clone())
    }
}

// ============================================================================
// Scripted provider
// ============================================================================

/// One scripted completion turn.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub text_deltas: Vec<String>,
    pub tool_requests: Vec<ToolRequest>,
    pub usage: Option<Usage>,
}

impl ScriptedTurn {
    pub fn text(content: &str) -> Self {
        Self {
            text_deltas: vec![content.to_string()],
            ..Self::default()
        }
    }

    pub fn tool_call(invocation_id: &str, tool_name: &str, arguments: serde_json::Value) -> Self {
        Self {
            tool_requests: vec![ToolRequest {
                invocation_id: invocation_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments,
            }],
            ..Self::default()
        }
    }
}

/// Deterministic in-process provider.
///
/// Pops one scripted turn per completion; with an empty script it echoes the
/// latest user message. Used by tests and by deployments without an external
/// backend wired in.
#[derive(Default)]
pub struct ScriptedProvider {
    turns: std::sync::Mutex<VecDeque<ScriptedTurn>>,
    errors: std::sync::Mutex<VecDeque<ProviderError>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
    }

    /// Fail the next completion with this error before any scripted turn is
    /// consumed.
    pub fn push_error(&self, error: ProviderError) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push_back(error);
        }
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        self.turns.lock().ok().and_then(|mut turns| turns.pop_front())
    }

    fn next_error(&self) -> Option<ProviderError> {
        self.errors.lock().ok().and_then(|mut errors| errors.pop_front())
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        history: &[HistoryEntry],
        _tools: &[ToolDefinition],
    ) -> Result<ProviderStream, ProviderError> {
        if let Some(error) = self.next_error() {
            return Err(error);
        }

        let turn = self.next_turn().unwrap_or_else(|| {
            let last_user = history
                .iter()
                .rev()
                .find_map(|entry| match entry {
                    HistoryEntry::User { content } => Some(content.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            ScriptedTurn::text(&last_user)
        });

        let mut events: Vec<Result<ProviderEvent, ProviderError>> = Vec::new();
        for delta in turn.text_deltas {
            events.push(Ok(ProviderEvent::TextDelta(delta)));
        }
        if !turn.tool_requests.is_empty() {
            events.push(Ok(ProviderEvent::ToolRequests(turn.tool_requests)));
        }
        events.push(Ok(ProviderEvent::Done { usage: turn.usage }));

        Ok(Box::pin(futures::stream::iter(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn history(content: &str) -> Vec<HistoryEntry> {
        vec![HistoryEntry::User {
            content: content.to_string(),
        }]
    }

    #[tokio::test]
    async fn scripted_turns_play_in_order() {
        let provider = ScriptedProvider::new();
        provider.push_turn(ScriptedTurn::text("first"));
        provider.push_turn(ScriptedTurn::text("second"));

        for expected in ["first", "second"] {
            let mut stream = provider.complete(&history("hi"), &[]).await.unwrap();
            let event = stream.next().await.unwrap().unwrap();
            assert!(matches!(event, ProviderEvent::TextDelta(text) if text == expected));
        }
    }

    #[tokio::test]
    async fn empty_script_echoes_last_user_message() {
        let provider = ScriptedProvider::new();
        let mut stream = provider.complete(&history("echo me"), &[]).await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, ProviderEvent::TextDelta(text) if text == "echo me"));
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            ProviderEvent::Done { .. }
        ));
    }

    #[tokio::test]
    async fn scripted_error_fails_completion() {
        let provider = ScriptedProvider::new();
        provider.push_error(ProviderError::RateLimited { retry_after: None });
        provider.push_turn(ScriptedTurn::text("after retry"));

        let err = provider.complete(&history("hi"), &[]).await.err().unwrap();
        assert!(err.is_retryable());

        let mut stream = provider.complete(&history("hi"), &[]).await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, ProviderEvent::TextDelta(text) if text == "after retry"));
    }

    #[test]
    fn registry_falls_back_to_default() {
        let registry = ProviderRegistry::new();
        registry.register("default", Arc::new(ScriptedProvider::new()));
        assert!(registry.client_for("research").is_some());
        assert!(registry.client_for("default").is_some());

        let empty = ProviderRegistry::new();
        assert!(empty.client_for("research").is_none());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.accumulate(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.accumulate(&Usage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.total_tokens, 18);
    }
}
