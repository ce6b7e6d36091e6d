//! Chat-completion façade over agent runs.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{RunChunk, Usage};
use crate::gateway::SubmitError;
use crate::response;
use crate::server::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct ChatCompletionRequest {
    /// Conversation identity; one session per conversation.
    conversation_id: String,
    /// Channel the conversation belongs to. API traffic defaults to the
    /// virtual `api:default` channel.
    #[serde(default = "default_channel")]
    channel: String,
    content: String,
    #[serde(default)]
    stream: bool,
    /// Opt in to intermediate tool-call events on the stream.
    #[serde(default)]
    include_tool_events: bool,
}

fn default_channel() -> String {
    "api:default".to_string()
}

#[derive(Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
}

// ============================================================================
// Handler
// ============================================================================

/// POST /v1/chat/completions
///
/// Creates or resumes the conversation's session and starts (or joins) an
/// agent run. With `stream: true` the run's chunks arrive as SSE events;
/// otherwise the response is buffered from the same chunk stream.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    if req.conversation_id.is_empty() {
        return response::bad_request("conversation_id must not be empty");
    }
    if req.content.is_empty() {
        return response::bad_request("content must not be empty");
    }

    let run = match state
        .gateway
        .submit_api_message(&req.channel, &req.conversation_id, &req.content)
        .await
    {
        Ok(run) => run,
        Err(SubmitError::NoRoute(channel)) => {
            return response::bad_request(format!("no route for channel '{}'", channel));
        }
        Err(e) => {
            return response::internal_error(format!("failed to submit message: {}", e));
        }
    };

    if req.stream {
        let stream = ChunkEventStream::new(run.chunks, run.cancel, req.include_tool_events);
        let keep_alive = KeepAlive::new()
            .interval(Duration::from_secs(state.keep_alive_interval_seconds))
            .text("keep-alive");
        return Sse::new(stream).keep_alive(keep_alive).into_response();
    }

    buffered_completion(run.chunks, run.cancel).await
}

/// Collect the chunk stream into one response.
async fn buffered_completion(
    mut chunks: mpsc::Receiver<RunChunk>,
    cancel: CancellationToken,
) -> Response {
    // A departing client (dropped future) must cancel the run.
    let mut guard = CancelGuard::new(cancel);
    let mut content = String::new();

    while let Some(chunk) = chunks.recv().await {
        match chunk {
            RunChunk::TextDelta { text } => content.push_str(&text),
            RunChunk::ToolCall { .. } => {}
            RunChunk::Completed { run_id, usage } => {
                guard.disarm();
                let body = ChatCompletionResponse {
                    id: run_id,
                    object: "chat.completion",
                    content,
                    usage,
                };
                return (StatusCode::OK, Json(body)).into_response();
            }
            RunChunk::Error { message } => {
                guard.disarm();
                return response::internal_error(message);
            }
        }
    }
    guard.disarm();
    response::internal_error("run ended without completing")
}

struct CancelGuard {
    cancel: CancellationToken,
    armed: bool,
}

impl CancelGuard {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cancel.cancel();
        }
    }
}

// ============================================================================
// SSE Streaming
// ============================================================================

/// Adapts a run's chunk stream into SSE events.
///
/// Drop safety: if the client goes away before the terminal chunk, dropping
/// the stream cancels the run, transitively stopping any running tool
/// invocation. The stream ends with a `[DONE]` marker after the completion
/// or error chunk.
struct ChunkEventStream {
    chunks: mpsc::Receiver<RunChunk>,
    cancel: CancellationToken,
    include_tool_events: bool,
    finished: bool,
    done_sent: bool,
}

impl ChunkEventStream {
    fn new(
        chunks: mpsc::Receiver<RunChunk>,
        cancel: CancellationToken,
        include_tool_events: bool,
    ) -> Self {
        Self {
            chunks,
            cancel,
            include_tool_events,
            finished: false,
            done_sent: false,
        }
    }
}

impl Drop for ChunkEventStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

impl futures::Stream for ChunkEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        loop {
            if self.finished {
                if !self.done_sent {
                    self.done_sent = true;
                    return Poll::Ready(Some(Ok(Event::default().data("[DONE]"))));
                }
                return Poll::Ready(None);
            }

            match self.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    if matches!(chunk, RunChunk::ToolCall { .. }) && !self.include_tool_events {
                        continue;
                    }
                    if matches!(chunk, RunChunk::Completed { .. } | RunChunk::Error { .. }) {
                        self.finished = true;
                    }
                    let event = Event::default()
                        .json_data(&chunk)
                        .unwrap_or_else(|_| Event::default().data("{}"));
                    return Poll::Ready(Some(Ok(event)));
                }
                // Sender gone without a terminal chunk: the run was torn
                // down externally. End the stream.
                Poll::Ready(None) => {
                    self.finished = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
