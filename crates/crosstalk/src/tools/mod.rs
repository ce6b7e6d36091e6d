//! Tool invocations requested by agent runs.
//!
//! A [`Tool`] is registered with the [`ToolExecutor`] and invoked with a
//! caller-supplied timeout and a cancellation token tied to the parent run.
//! Every outcome is classified into an [`InvocationState`]; tool failures are
//! data handed back to the orchestrator, never process faults.

pub mod error;
pub mod executor;

pub use error::ToolError;
pub use executor::{ToolExecutor, ToolResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Invocation state
// ============================================================================

/// Lifecycle of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvocationState::Pending | InvocationState::Running)
    }
}

impl std::fmt::Display for InvocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InvocationState::Pending => "pending",
            InvocationState::Running => "running",
            InvocationState::Succeeded => "succeeded",
            InvocationState::Failed => "failed",
            InvocationState::TimedOut => "timed_out",
            InvocationState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Sandbox policy
// ============================================================================

/// Broad classification of what a tool is allowed to touch. Ordered from
/// least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectClass {
    /// Pure computation, no observable side effects.
    Pure,
    /// May read or write the local filesystem.
    FileSystem,
    /// May reach the network.
    Network,
}

/// Per-tool resource policy enforced by the executor.
///
/// Violations are classified as invocation failures; the executor itself
/// never crashes on them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Most privileged side-effect class the tool may declare.
    pub max_side_effects: SideEffectClass,
    /// Output larger than this fails the invocation.
    pub max_output_bytes: usize,
}

impl SandboxPolicy {
    pub fn allows(&self, declared: SideEffectClass) -> bool {
        declared <= self.max_side_effects
    }
}

// ============================================================================
// Tool contract
// ============================================================================

/// One tool the agent can call.
///
/// `run` must honor the cancellation token at every suspension point; the
/// executor additionally bounds it with a timeout.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool's arguments, if it declares one.
    fn parameters(&self) -> Option<serde_json::Value> {
        None
    }

    /// The most privileged side-effect class this tool requires.
    fn side_effects(&self) -> SideEffectClass {
        SideEffectClass::Pure
    }

    async fn run(
        &self,
        arguments: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError>;
}

// ============================================================================
// Invocation record
// ============================================================================

/// One tool call requested by the agent within a run. Owned by its parent
/// run; archived with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub invocation_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub state: InvocationState,
    /// Result content or error description, depending on `state`.
    pub content: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ToolInvocation {
    pub fn succeeded(&self) -> bool {
        self.state == InvocationState::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_state_terminality() {
        assert!(!InvocationState::Pending.is_terminal());
        assert!(!InvocationState::Running.is_terminal());
        assert!(InvocationState::Succeeded.is_terminal());
        assert!(InvocationState::Failed.is_terminal());
        assert!(InvocationState::TimedOut.is_terminal());
        assert!(InvocationState::Cancelled.is_terminal());
    }

    #[test]
    fn sandbox_policy_ordering() {
        let policy = SandboxPolicy {
            max_side_effects: SideEffectClass::FileSystem,
            max_output_bytes: 1024,
        };
        assert!(policy.allows(SideEffectClass::Pure));
        assert!(policy.allows(SideEffectClass::FileSystem));
        assert!(!policy.allows(SideEffectClass::Network));
    }
}
