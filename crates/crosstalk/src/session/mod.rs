//! Sessions: durable per-conversation agent state.

pub mod store;

pub use store::{SessionStore, StorageError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crosstalk_connector_protocol::Message;

use crate::agent::{AgentRun, Usage};

// ============================================================================
// Session
// ============================================================================

/// Durable record of one ongoing conversation with the agent.
///
/// Owned by the [`SessionStore`]; mutated only while the caller holds the
/// session's exclusive processing lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Derived from channel id + conversation id.
    pub session_id: String,
    pub channel_id: String,
    pub conversation_id: String,
    /// Agent configuration profile from the routing rule that created it.
    pub profile: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Highest inbound sequence number recorded into history.
    pub last_seq: u64,
}

impl Session {
    /// Derive the stable session id for a channel + conversation pair.
    pub fn derive_id(channel_id: &str, conversation_id: &str) -> String {
        format!("{}--{}", sanitize(channel_id), sanitize(conversation_id))
    }
}

/// Make an identifier safe to use as a file name.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ============================================================================
// Events
// ============================================================================

/// One entry in a session's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: SessionEventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventPayload {
    InboundMessage {
        message: Message,
    },
    AssistantMessage {
        run_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    ToolCall {
        run_id: String,
        invocation_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        run_id: String,
        invocation_id: String,
        tool_name: String,
        success: bool,
        content: String,
    },
    /// Terminal run record, archived when the run leaves the active table.
    RunArchived {
        run: AgentRun,
    },
    /// A user-visible error persisted into the conversation.
    ErrorNote {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        message: String,
    },
}

// ============================================================================
// History (provider view)
// ============================================================================

/// The session history as consumed by the AI provider client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum HistoryEntry {
    User {
        content: String,
    },
    Assistant {
        content: String,
    },
    ToolResult {
        invocation_id: String,
        tool_name: String,
        success: bool,
        content: String,
    },
}

impl SessionEventPayload {
    /// Project a persisted event into the provider-facing history, if it
    /// contributes one.
    pub fn to_history(&self) -> Option<HistoryEntry> {
        match self {
            SessionEventPayload::InboundMessage { message } => Some(HistoryEntry::User {
                content: message.text(),
            }),
            SessionEventPayload::AssistantMessage { content, .. } => {
                Some(HistoryEntry::Assistant {
                    content: content.clone(),
                })
            }
            SessionEventPayload::ToolResult {
                invocation_id,
                tool_name,
                success,
                content,
                ..
            } => Some(HistoryEntry::ToolResult {
                invocation_id: invocation_id.clone(),
                tool_name: tool_name.clone(),
                success: *success,
                content: content.clone(),
            }),
            _ => None,
        }
    }
}
