//! Tool execution errors.

use thiserror::Error;

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool not registered with the executor.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// Tool execution failed.
    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),

    /// Failed to parse tool arguments.
    #[error("failed to parse tool arguments: {0}")]
    InvalidArguments(String),

    /// Tool requires side effects the sandbox policy does not allow.
    #[error("sandbox policy violation for '{tool}': {detail}")]
    PolicyViolation { tool: String, detail: String },

    /// I/O error inside a tool.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
