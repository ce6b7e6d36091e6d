//! Agent runs: the unit of one reasoning cycle over a session.

pub mod orchestrator;
pub mod provider;

pub use orchestrator::{Orchestrator, OrchestratorDeps, RunError, RunHandle};
pub use provider::{
    ProviderClient, ProviderError, ProviderEvent, ProviderRegistry, ProviderStream,
    ScriptedProvider, ScriptedTurn, ToolDefinition, ToolRequest, Usage,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::InvocationState;

// ============================================================================
// Run state
// ============================================================================

/// State machine of one agent run.
///
/// `Queued → Running → (WaitingForTool ⇄ Running)* → Responding → Completed`,
/// with `Failed` on unrecoverable provider errors and `Cancelled` on external
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    WaitingForTool,
    Responding,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::WaitingForTool => "waiting_for_tool",
            RunState::Responding => "responding",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Run records
// ============================================================================

/// Record of one tool invocation owned by a run, archived into session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub invocation_id: String,
    pub tool_name: String,
    pub state: InvocationState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One invocation of the agent over a session.
///
/// Created when an inbound message (or API request) arrives for an idle
/// session; archived into session history on reaching a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: String,
    pub session_id: String,
    /// The message that started this run.
    pub trigger_message_id: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Accumulated assistant output.
    pub output: String,
    pub invocations: Vec<InvocationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl AgentRun {
    pub fn new(session_id: impl Into<String>, trigger_message_id: impl Into<String>) -> Self {
        Self {
            run_id: ulid::Ulid::new().to_string().to_lowercase(),
            session_id: session_id.into(),
            trigger_message_id: trigger_message_id.into(),
            state: RunState::Queued,
            started_at: Utc::now(),
            ended_at: None,
            output: String::new(),
            invocations: Vec::new(),
            usage: None,
        }
    }
}

// ============================================================================
// Output chunks
// ============================================================================

/// One unit of a run's incremental output, consumed by the protocol façade
/// or buffered for connector replies.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunChunk {
    TextDelta {
        text: String,
    },
    /// Tool lifecycle events, emitted only when the caller opted in.
    ToolCall {
        invocation_id: String,
        tool_name: String,
        state: InvocationState,
    },
    Completed {
        run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        message: String,
    },
}

pub type ChunkSender = tokio::sync::mpsc::Sender<RunChunk>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_terminality() {
        assert!(!RunState::Queued.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(!RunState::WaitingForTool.is_terminal());
        assert!(!RunState::Responding.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
    }

    #[test]
    fn new_run_is_queued() {
        let run = AgentRun::new("sess-1", "msg-1");
        assert_eq!(run.state, RunState::Queued);
        assert_eq!(run.run_id.len(), 26);
        assert!(run.invocations.is_empty());
    }

    #[test]
    fn chunk_serialization() {
        let chunk = RunChunk::TextDelta {
            text: "hi".to_string(),
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"type\":\"text_delta\""));
    }
}
