//! Tool executor for running agent-requested invocations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{ToolDefinition, ToolRequest};
use crate::config::ToolConfig;

use super::error::ToolError;
use super::{InvocationState, SandboxPolicy, Tool, ToolInvocation};

// ============================================================================
// Types
// ============================================================================

/// Result of a tool execution, shaped for provider consumption.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Whether the tool succeeded.
    pub success: bool,
    /// Content for provider consumption.
    pub content: String,
}

// ============================================================================
// Executor
// ============================================================================

/// Executor for running tools.
///
/// Every invocation runs under the configured timeout and a child of the
/// parent run's cancellation token. Outcomes are always classified into a
/// terminal [`InvocationState`]; nothing a tool does can crash the executor.
pub struct ToolExecutor {
    /// Registered tools by name.
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Sandbox policy applied to every tool.
    policy: SandboxPolicy,
    /// Invocation timeout.
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            tools: HashMap::new(),
            policy: SandboxPolicy {
                max_side_effects: config.max_side_effects,
                max_output_bytes: config.max_output_bytes,
            },
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// Register a tool. A later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Check if any tools are registered.
    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    /// Generate tool definitions for the provider.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute one tool request under the run's cancellation token.
    ///
    /// Always returns a terminal invocation record; errors become `failed`,
    /// the timeout becomes `timed_out`, and cancellation becomes `cancelled`.
    pub async fn execute(
        &self,
        request: &ToolRequest,
        run_cancel: &CancellationToken,
    ) -> ToolInvocation {
        let mut invocation = ToolInvocation {
            invocation_id: request.invocation_id.clone(),
            tool_name: request.tool_name.clone(),
            arguments: request.arguments.clone(),
            state: InvocationState::Pending,
            content: String::new(),
            started_at: Utc::now(),
            ended_at: None,
        };

        // A cancelled run starts nothing new.
        if run_cancel.is_cancelled() {
            invocation.state = InvocationState::Cancelled;
            invocation.content = "run cancelled before invocation started".to_string();
            invocation.ended_at = Some(Utc::now());
            return invocation;
        }

        let tool = match self.tools.get(&request.tool_name) {
            Some(tool) => tool.clone(),
            None => {
                invocation.state = InvocationState::Failed;
                invocation.content = ToolError::NotFound(request.tool_name.clone()).to_string();
                invocation.ended_at = Some(Utc::now());
                return invocation;
            }
        };

        if !self.policy.allows(tool.side_effects()) {
            invocation.state = InvocationState::Failed;
            invocation.content = ToolError::PolicyViolation {
                tool: request.tool_name.clone(),
                detail: format!(
                    "requires {:?} side effects, policy allows up to {:?}",
                    tool.side_effects(),
                    self.policy.max_side_effects
                ),
            }
            .to_string();
            invocation.ended_at = Some(Utc::now());
            warn!(tool = %request.tool_name, "Sandbox policy rejected invocation");
            return invocation;
        }

        invocation.state = InvocationState::Running;
        debug!(
            tool = %request.tool_name,
            invocation = %request.invocation_id,
            "Executing tool"
        );

        // Child token: the run cancels us, and a timeout lets us signal the
        // tool to stop without touching siblings.
        let cancel = run_cancel.child_token();
        let outcome = tokio::select! {
            _ = run_cancel.cancelled() => {
                cancel.cancel();
                Outcome::Cancelled
            }
            result = tokio::time::timeout(self.timeout, tool.run(&request.arguments, &cancel)) => {
                match result {
                    // A cooperative tool may return normally in response to
                    // the cancel signal; the run's verdict wins over the
                    // tool's return value.
                    Ok(_) if run_cancel.is_cancelled() => Outcome::Cancelled,
                    Ok(Ok(content)) => Outcome::Done(content),
                    Ok(Err(e)) => Outcome::Failed(e.to_string()),
                    Err(_) => {
                        cancel.cancel();
                        Outcome::TimedOut
                    }
                }
            }
        };

        match outcome {
            Outcome::Done(content) => {
                if content.len() > self.policy.max_output_bytes {
                    invocation.state = InvocationState::Failed;
                    invocation.content = format!(
                        "tool output of {} bytes exceeds the {} byte limit",
                        content.len(),
                        self.policy.max_output_bytes
                    );
                } else {
                    invocation.state = InvocationState::Succeeded;
                    invocation.content = content;
                }
            }
            Outcome::Failed(detail) => {
                invocation.state = InvocationState::Failed;
                invocation.content = detail;
            }
            Outcome::TimedOut => {
                invocation.state = InvocationState::TimedOut;
                invocation.content =
                    format!("tool exceeded its {}s timeout", self.timeout.as_secs());
            }
            Outcome::Cancelled => {
                invocation.state = InvocationState::Cancelled;
                invocation.content = "invocation cancelled".to_string();
            }
        }
        invocation.ended_at = Some(Utc::now());
        debug!(
            tool = %request.tool_name,
            invocation = %request.invocation_id,
            state = %invocation.state,
            "Tool finished"
        );
        invocation
    }

    /// Shape a terminal invocation as the result the provider sees.
    pub fn to_result(invocation: &ToolInvocation) -> ToolResult {
        ToolResult {
            success: invocation.succeeded(),
            content: invocation.content.clone(),
        }
    }
}

enum Outcome {
    Done(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::SideEffectClass;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its input"
        }

        async fn run(
            &self,
            arguments: &serde_json::Value,
            _cancel: &CancellationToken,
        ) -> Result<String, ToolError> {
            let text = arguments
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::InvalidArguments("missing 'text'".to_string()))?;
            Ok(text.to_string())
        }
    }

    /// Sleeps until cancelled or for a long time.
    struct SleepTool;

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "sleep"
        }

        fn description(&self) -> &str {
            "Waits forever"
        }

        async fn run(
            &self,
            _arguments: &serde_json::Value,
            cancel: &CancellationToken,
        ) -> Result<String, ToolError> {
            tokio::select! {
                _ = cancel.cancelled() => Ok("interrupted".to_string()),
                _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok("slept".to_string()),
            }
        }
    }

    /// Cancels the run it belongs to, then returns normally.
    struct QuitTool {
        run_cancel: CancellationToken,
    }

    #[async_trait]
    impl Tool for QuitTool {
        fn name(&self) -> &str {
            "quit"
        }

        fn description(&self) -> &str {
            "Stops the run"
        }

        async fn run(
            &self,
            _arguments: &serde_json::Value,
            _cancel: &CancellationToken,
        ) -> Result<String, ToolError> {
            self.run_cancel.cancel();
            Ok("stopping".to_string())
        }
    }

    struct NetworkTool;

    #[async_trait]
    impl Tool for NetworkTool {
        fn name(&self) -> &str {
            "fetch"
        }

        fn description(&self) -> &str {
            "Pretends to reach the network"
        }

        fn side_effects(&self) -> SideEffectClass {
            SideEffectClass::Network
        }

        async fn run(
            &self,
            _arguments: &serde_json::Value,
            _cancel: &CancellationToken,
        ) -> Result<String, ToolError> {
            Ok("response".to_string())
        }
    }

    fn test_config() -> ToolConfig {
        ToolConfig {
            timeout_seconds: 30,
            max_output_bytes: 64,
            max_side_effects: SideEffectClass::FileSystem,
            retry_on_timeout: false,
        }
    }

    fn request(tool: &str, arguments: serde_json::Value) -> ToolRequest {
        ToolRequest {
            invocation_id: "call_1".to_string(),
            tool_name: tool.to_string(),
            arguments,
        }
    }

    fn executor_with(tools: Vec<Arc<dyn Tool>>) -> ToolExecutor {
        let mut executor = ToolExecutor::new(&test_config());
        for tool in tools {
            executor.register(tool);
        }
        executor
    }

    #[tokio::test]
    async fn echo_succeeds() {
        let executor = executor_with(vec![Arc::new(EchoTool)]);
        let invocation = executor
            .execute(
                &request("echo", serde_json::json!({"text": "hello"})),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(invocation.state, InvocationState::Succeeded);
        assert_eq!(invocation.content, "hello");
        assert!(invocation.ended_at.is_some());
    }

    #[tokio::test]
    async fn bad_arguments_fail() {
        let executor = executor_with(vec![Arc::new(EchoTool)]);
        let invocation = executor
            .execute(
                &request("echo", serde_json::json!({})),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(invocation.state, InvocationState::Failed);
        assert!(invocation.content.contains("missing 'text'"));
    }

    #[tokio::test]
    async fn unknown_tool_fails() {
        let executor = executor_with(vec![]);
        let invocation = executor
            .execute(
                &request("nope", serde_json::json!({})),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(invocation.state, InvocationState::Failed);
        assert!(invocation.content.contains("not found"));
    }

    #[tokio::test]
    async fn sandbox_rejects_excess_privilege() {
        let executor = executor_with(vec![Arc::new(NetworkTool)]);
        let invocation = executor
            .execute(
                &request("fetch", serde_json::json!({})),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(invocation.state, InvocationState::Failed);
        assert!(invocation.content.contains("sandbox policy violation"));
    }

    #[tokio::test]
    async fn oversized_output_fails() {
        let executor = executor_with(vec![Arc::new(EchoTool)]);
        let big = "x".repeat(65);
        let invocation = executor
            .execute(
                &request("echo", serde_json::json!({"text": big})),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(invocation.state, InvocationState::Failed);
        assert!(invocation.content.contains("byte limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_classifies_as_timed_out() {
        let executor = executor_with(vec![Arc::new(SleepTool)]);
        let invocation = executor
            .execute(
                &request("sleep", serde_json::json!({})),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(invocation.state, InvocationState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn run_cancellation_stops_invocation() {
        let executor = executor_with(vec![Arc::new(SleepTool)]);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let invocation = executor
            .execute(&request("sleep", serde_json::json!({})), &cancel)
            .await;
        assert_eq!(invocation.state, InvocationState::Cancelled);
    }

    #[tokio::test]
    async fn cooperative_exit_during_cancellation_is_cancelled() {
        // The tool cancels the run mid-execution and still returns Ok; the
        // invocation must not be classified as succeeded.
        let cancel = CancellationToken::new();
        let executor = executor_with(vec![Arc::new(QuitTool {
            run_cancel: cancel.clone(),
        })]);
        let invocation = executor
            .execute(&request("quit", serde_json::json!({})), &cancel)
            .await;
        assert_eq!(invocation.state, InvocationState::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_run_starts_nothing() {
        let executor = executor_with(vec![Arc::new(EchoTool)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let invocation = executor
            .execute(&request("echo", serde_json::json!({"text": "hi"})), &cancel)
            .await;
        assert_eq!(invocation.state, InvocationState::Cancelled);
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let executor = executor_with(vec![Arc::new(SleepTool), Arc::new(EchoTool)]);
        let defs = executor.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[1].name, "sleep");
        assert!(executor.has_tools());
    }
}
