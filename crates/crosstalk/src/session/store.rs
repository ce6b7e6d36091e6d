//! File-backed session store.
//!
//! Each session is one append-only JSONL event log plus a small snapshot
//! (`<id>.meta.json`) written atomically via temp file + rename. An in-memory
//! index mirrors the files so the hot path never re-reads the log; the log is
//! the durable source of truth and can be replayed for audit.
//!
//! Store unavailability is surfaced as [`StorageError`] and fails the caller
//! fast; nothing is silently dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crosstalk_connector_protocol::Message;

use super::{HistoryEntry, Session, SessionEvent, SessionEventPayload};
use crate::sync::KeyedLocks;

// ============================================================================
// StorageError
// ============================================================================

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file I/O error at {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record in {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("session '{0}' not found")]
    NotFound(String),
}

impl StorageError {
    fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }
}

// ============================================================================
// SessionStore
// ============================================================================

struct SessionEntry {
    meta: Session,
    history: Vec<HistoryEntry>,
}

#[derive(Clone)]
pub struct SessionStore {
    root: PathBuf,
    index: Arc<DashMap<String, Arc<Mutex<SessionEntry>>>>,
    processing_locks: KeyedLocks,
}

impl SessionStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::file_io(&root, e))?;
        Ok(Self {
            root,
            index: Arc::new(DashMap::new()),
            processing_locks: KeyedLocks::new(),
        })
    }

    /// The exclusive processing lock for a session. Held by the orchestrator
    /// for the duration of one inbound item.
    pub fn processing_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.processing_locks.get(session_id)
    }

    /// Resolve a session, creating and persisting it on first use.
    pub async fn resolve(
        &self,
        channel_id: &str,
        conversation_id: &str,
        profile: &str,
    ) -> StorageResult<Session> {
        let session_id = Session::derive_id(channel_id, conversation_id);
        let entry = self.entry(&session_id).await?;
        let mut guard = entry.lock().await;
        if guard.meta.session_id.is_empty() {
            let now = Utc::now();
            let meta = Session {
                session_id: session_id.clone(),
                channel_id: channel_id.to_string(),
                conversation_id: conversation_id.to_string(),
                profile: profile.to_string(),
                created_at: now,
                updated_at: now,
                last_seq: 0,
            };
            // In-memory state is adopted only once the snapshot is durable,
            // so a failed create leaves the session cleanly uncreated.
            self.persist_meta(&meta).await?;
            guard.meta = meta;
            debug!(session = %session_id, "Created session");
        }
        Ok(guard.meta.clone())
    }

    /// Look up an existing session without creating one.
    pub async fn get(&self, session_id: &str) -> StorageResult<Session> {
        let entry = self.entry(session_id).await?;
        let guard = entry.lock().await;
        if guard.meta.session_id.is_empty() {
            return Err(StorageError::NotFound(session_id.to_string()));
        }
        Ok(guard.meta.clone())
    }

    /// Append one event to the session's log and in-memory history.
    pub async fn append_event(
        &self,
        session_id: &str,
        payload: SessionEventPayload,
    ) -> StorageResult<()> {
        let entry = self.entry(session_id).await?;
        let mut guard = entry.lock().await;
        if guard.meta.session_id.is_empty() {
            return Err(StorageError::NotFound(session_id.to_string()));
        }

        let event = SessionEvent {
            at: Utc::now(),
            payload,
        };
        let path = self.events_path(session_id);
        let line = serde_json::to_string(&event).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            detail: e.to_string(),
        })?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;

        if let Some(history) = event.payload.to_history() {
            guard.history.push(history);
        }
        guard.meta.updated_at = event.at;
        if let SessionEventPayload::InboundMessage { message } = &event.payload {
            if message.seq > guard.meta.last_seq {
                guard.meta.last_seq = message.seq;
            }
        }
        self.persist_meta(&guard.meta).await?;
        Ok(())
    }

    /// Provider-facing history for a session.
    pub async fn history(&self, session_id: &str) -> StorageResult<Vec<HistoryEntry>> {
        let entry = self.entry(session_id).await?;
        let guard = entry.lock().await;
        if guard.meta.session_id.is_empty() {
            return Err(StorageError::NotFound(session_id.to_string()));
        }
        Ok(guard.history.clone())
    }

    /// Highest inbound sequence number seen for a channel + conversation, or
    /// zero when the session does not exist yet.
    pub async fn last_seq(&self, channel_id: &str, conversation_id: &str) -> u64 {
        let session_id = Session::derive_id(channel_id, conversation_id);
        match self.entry(&session_id).await {
            Ok(entry) => entry.lock().await.meta.last_seq,
            Err(_) => 0,
        }
    }

    /// Record an unroutable message. Dead letters are never silently dropped.
    pub async fn dead_letter(&self, message: &Message, reason: &str) -> StorageResult<()> {
        let path = self.root.join("dead_letter.jsonl");
        let record = serde_json::json!({
            "at": Utc::now(),
            "reason": reason,
            "message": message,
        });
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;
        file.write_all(record.to_string().as_bytes())
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| StorageError::file_io(&path, e))?;
        warn!(message_id = %message.id, reason, "Dead-lettered message");
        Ok(())
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Get or load the in-memory entry for a session. A missing file yields
    /// an entry with an empty meta, filled in by `resolve`.
    async fn entry(&self, session_id: &str) -> StorageResult<Arc<Mutex<SessionEntry>>> {
        if let Some(entry) = self.index.get(session_id) {
            return Ok(entry.clone());
        }

        let loaded = self.load_from_disk(session_id).await?;
        let entry = self
            .index
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)))
            .clone();
        Ok(entry)
    }

    async fn load_from_disk(&self, session_id: &str) -> StorageResult<SessionEntry> {
        let meta_path = self.meta_path(session_id);
        let meta: Session = match fs::read_to_string(&meta_path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StorageError::Corrupt {
                    path: meta_path.clone(),
                    detail: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SessionEntry {
                    meta: empty_session(),
                    history: Vec::new(),
                });
            }
            Err(e) => return Err(StorageError::file_io(&meta_path, e)),
        };

        let events_path = self.events_path(session_id);
        let mut history = Vec::new();
        match fs::read_to_string(&events_path).await {
            Ok(content) => {
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event: SessionEvent =
                        serde_json::from_str(line).map_err(|e| StorageError::Corrupt {
                            path: events_path.clone(),
                            detail: format!("line {}: {}", line_no + 1, e),
                        })?;
                    if let Some(entry) = event.payload.to_history() {
                        history.push(entry);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::file_io(&events_path, e)),
        }

        debug!(session = %session_id, entries = history.len(), "Loaded session from disk");
        Ok(SessionEntry { meta, history })
    }

    /// Write the session snapshot atomically (temp file + rename).
    async fn persist_meta(&self, meta: &Session) -> StorageResult<()> {
        let final_path = self.meta_path(&meta.session_id);
        let data = serde_json::to_vec_pretty(meta).map_err(|e| StorageError::Corrupt {
            path: final_path.clone(),
            detail: e.to_string(),
        })?;
        atomic_write_file(&final_path, &data).await
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.meta.json", session_id))
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", session_id))
    }
}

fn empty_session() -> Session {
    Session {
        session_id: String::new(),
        channel_id: String::new(),
        conversation_id: String::new(),
        profile: String::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        last_seq: 0,
    }
}

/// Write data to a temp file, fsync it, then atomically rename to the final
/// path. The temp name embeds a ULID so concurrent writers cannot collide.
async fn atomic_write_file(final_path: &Path, data: &[u8]) -> StorageResult<()> {
    let file_name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let temp_path = final_path.with_file_name(format!("{}.{}.tmp", file_name, ulid::Ulid::new()));

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| StorageError::file_io(&temp_path, e))?;
    file.write_all(data)
        .await
        .map_err(|e| StorageError::file_io(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StorageError::file_io(&temp_path, e))?;
    fs::rename(&temp_path, final_path)
        .await
        .map_err(|e| StorageError::file_io(final_path, e))?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crosstalk_connector_protocol::Sender;
    use tempfile::TempDir;

    fn inbound(conversation: &str, text: &str, seq: u64) -> Message {
        Message::inbound_text(
            "loopback:demo",
            conversation,
            Sender {
                id: "u1".to_string(),
                display_name: None,
            },
            text,
            seq,
        )
    }

    #[tokio::test]
    async fn resolve_creates_and_reuses() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();

        let a = store.resolve("loopback:demo", "conv-1", "default").await.unwrap();
        let b = store.resolve("loopback:demo", "conv-1", "default").await.unwrap();
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(a.created_at, b.created_at);
    }

    #[tokio::test]
    async fn append_builds_history_and_tracks_seq() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let session = store
            .resolve("loopback:demo", "conv-1", "default")
            .await
            .unwrap();

        store
            .append_event(
                &session.session_id,
                SessionEventPayload::InboundMessage {
                    message: inbound("conv-1", "question", 1),
                },
            )
            .await
            .unwrap();
        store
            .append_event(
                &session.session_id,
                SessionEventPayload::AssistantMessage {
                    run_id: "r1".to_string(),
                    content: "answer".to_string(),
                    usage: None,
                },
            )
            .await
            .unwrap();

        let history = store.history(&session.session_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(matches!(&history[0], HistoryEntry::User { content } if content == "question"));
        assert!(matches!(&history[1], HistoryEntry::Assistant { content } if content == "answer"));
        assert_eq!(store.last_seq("loopback:demo", "conv-1").await, 1);
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let session_id = {
            let store = SessionStore::open(dir.path()).await.unwrap();
            let session = store
                .resolve("loopback:demo", "conv-1", "default")
                .await
                .unwrap();
            store
                .append_event(
                    &session.session_id,
                    SessionEventPayload::InboundMessage {
                        message: inbound("conv-1", "persisted?", 4),
                    },
                )
                .await
                .unwrap();
            session.session_id
        };

        let store = SessionStore::open(dir.path()).await.unwrap();
        let history = store.history(&session_id).await.unwrap();
        assert_eq!(history.len(), 1);
        let meta = store.get(&session_id).await.unwrap();
        assert_eq!(meta.last_seq, 4);
    }

    #[tokio::test]
    async fn failed_create_leaves_session_uncreated() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();

        let session_id = Session::derive_id("loopback:demo", "conv-1");
        let blocked = dir.path().join(format!("{}.meta.json", session_id));
        std::fs::create_dir(&blocked).unwrap();

        let result = store.resolve("loopback:demo", "conv-1", "default").await;
        assert!(result.is_err());
        assert!(matches!(
            store.get(&session_id).await,
            Err(StorageError::NotFound(_))
        ));

        // Once the path is writable again the same session can be created.
        std::fs::remove_dir(&blocked).unwrap();
        let session = store
            .resolve("loopback:demo", "conv-1", "default")
            .await
            .unwrap();
        assert_eq!(session.session_id, session_id);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.get("nope").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store
                .append_event(
                    "nope",
                    SessionEventPayload::ErrorNote {
                        run_id: None,
                        message: "x".to_string()
                    }
                )
                .await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dead_letter_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        store
            .dead_letter(&inbound("conv-x", "lost", 1), "no matching routing rule")
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("dead_letter.jsonl")).unwrap();
        assert!(content.contains("no matching routing rule"));
        assert!(content.contains("lost"));
    }

    #[tokio::test]
    async fn processing_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let lock = store.processing_lock("sess-1");
        let _guard = lock.lock().await;
        assert!(store.processing_lock("sess-1").try_lock().is_err());
        assert!(store.processing_lock("sess-2").try_lock().is_ok());
    }
}
