//! Inbound message routing.
//!
//! Maps a normalized message to a target session via the routing table,
//! deduplicates replays, and admits the message into its conversation queue.
//! The table is read by every routing call and written only by an explicit
//! reload; unroutable messages are dead-lettered, never silently dropped.

pub mod dedup;

pub use dedup::DedupCache;

use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crosstalk_connector_protocol::Message;

use crate::agent::ChunkSender;
use crate::config::{DedupConfig, RouteConfig};
use crate::queue::{AdmitOutcome, QueueItem, QueueManager};
use crate::session::{Session, SessionStore, StorageError};

// ============================================================================
// Routing rules
// ============================================================================

/// How a matched message maps onto a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One session per conversation. The default.
    PerConversation,
    /// All conversations on the channel share one session.
    PerAccount,
}

/// One compiled routing rule.
#[derive(Debug, Clone)]
struct Rule {
    platform: String,
    account_pattern: String,
    strategy: Strategy,
    profile: String,
}

impl Rule {
    fn matches(&self, platform: &str, account: &str) -> bool {
        if self.platform != platform {
            return false;
        }
        match self.account_pattern.strip_suffix('*') {
            Some(prefix) => account.starts_with(prefix),
            None => self.account_pattern == account,
        }
    }
}

/// Compiled routing table. Immutable once built; replaced whole on reload.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: Vec<Rule>,
}

impl RoutingTable {
    /// Compile the configured rules, rejecting unknown strategies up front.
    pub fn compile(configs: &[RouteConfig]) -> Result<Self, RoutingError> {
        let mut rules = Vec::with_capacity(configs.len());
        for config in configs {
            let strategy = match config.strategy.as_str() {
                "per_conversation" => Strategy::PerConversation,
                "per_account" => Strategy::PerAccount,
                other => {
                    return Err(RoutingError::InvalidStrategy {
                        platform: config.platform.clone(),
                        strategy: other.to_string(),
                    });
                }
            };
            rules.push(Rule {
                platform: config.platform.clone(),
                account_pattern: config.account.clone(),
                strategy,
                profile: config.profile.clone(),
            });
        }
        Ok(Self { rules })
    }

    /// First rule matching (platform, account), in configuration order.
    fn select(&self, platform: &str, account: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(platform, account))
    }
}

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("unknown routing strategy '{strategy}' for platform '{platform}'")]
    InvalidStrategy { platform: String, strategy: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Admitted into its conversation queue.
    Admitted(AdmitOutcome),
    /// Replayed message id; success upstream, no second effect here.
    Duplicate,
    /// No matching rule; recorded in the dead-letter log.
    DeadLettered,
}

// ============================================================================
// Router
// ============================================================================

pub struct Router {
    table: RwLock<Arc<RoutingTable>>,
    dedup: DedupCache,
    sessions: SessionStore,
    queues: QueueManager,
}

impl Router {
    pub fn new(
        table: RoutingTable,
        dedup: &DedupConfig,
        sessions: SessionStore,
        queues: QueueManager,
    ) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            dedup: DedupCache::new(Duration::from_secs(dedup.window_seconds)),
            sessions,
            queues,
        }
    }

    /// Swap in a new routing table. The hot path picks it up on its next read.
    pub fn reload(&self, table: RoutingTable) {
        match self.table.write() {
            Ok(mut current) => *current = Arc::new(table),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(table),
        }
    }

    fn current_table(&self) -> Arc<RoutingTable> {
        match self.table.read() {
            Ok(table) => table.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Route one inbound message toward its session.
    ///
    /// `chunks` carries incremental output for API-originated messages, which
    /// are also `critical` (never dropped by queue overflow).
    pub async fn route(
        &self,
        message: Message,
        chunks: Option<ChunkSender>,
        critical: bool,
        cancel: CancellationToken,
    ) -> Result<RouteOutcome, RoutingError> {
        if self.dedup.is_replay(&message.id) {
            debug!(message_id = %message.id, "Duplicate message id, dropping");
            return Ok(RouteOutcome::Duplicate);
        }

        let (platform, account) = split_channel_id(&message.channel_id);
        let table = self.current_table();
        let Some(rule) = table.select(platform, account) else {
            self.sessions
                .dead_letter(&message, "no matching routing rule")
                .await?;
            return Ok(RouteOutcome::DeadLettered);
        };

        let session = self.resolve_session(rule, &message).await?;
        // A fresh conversation seeds order tracking at the incoming sequence
        // number; a resumed one picks up where its history left off.
        let expected_first_seq = match rule.strategy {
            Strategy::PerConversation if session.last_seq > 0 => session.last_seq + 1,
            _ => message.seq,
        };

        debug!(
            message_id = %message.id,
            session = %session.session_id,
            profile = %rule.profile,
            seq = message.seq,
            "Routed message"
        );

        let message_id = message.id.clone();
        let item = QueueItem {
            message,
            session_id: session.session_id,
            profile: rule.profile.clone(),
            critical,
            chunks,
            cancel,
        };
        let outcome = self.queues.admit(item, expected_first_seq).await;
        if outcome == AdmitOutcome::Stale {
            warn!("Message arrived behind the conversation's processed sequence, dropped");
        }
        // Recorded only now: a message that failed before admission (storage
        // error, dead letter) keeps its id eligible for retry.
        self.dedup.record(&message_id);
        Ok(RouteOutcome::Admitted(outcome))
    }

    async fn resolve_session(
        &self,
        rule: &Rule,
        message: &Message,
    ) -> Result<Session, StorageError> {
        let conversation_key = match rule.strategy {
            Strategy::PerConversation => message.conversation_id.as_str(),
            Strategy::PerAccount => "account",
        };
        self.sessions
            .resolve(&message.channel_id, conversation_key, &rule.profile)
            .await
    }
}

fn split_channel_id(channel_id: &str) -> (&str, &str) {
    channel_id
        .split_once(':')
        .unwrap_or((channel_id, ""))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::ItemProcessor;
    use async_trait::async_trait;
    use crosstalk_connector_protocol::Sender;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Notify};

    struct RecordingProcessor {
        processed: StdMutex<Vec<String>>,
        done: Notify,
    }

    impl RecordingProcessor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                processed: StdMutex::new(Vec::new()),
                done: Notify::new(),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.processed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ItemProcessor for RecordingProcessor {
        async fn try_steer(&self, item: QueueItem) -> Option<QueueItem> {
            Some(item)
        }

        async fn process(&self, item: QueueItem) {
            self.processed
                .lock()
                .unwrap()
                .push(format!("{}:{}", item.session_id, item.message.seq));
            self.done.notify_one();
        }
    }

    fn route_config(platform: &str, account: &str, strategy: &str, profile: &str) -> RouteConfig {
        RouteConfig {
            platform: platform.to_string(),
            account: account.to_string(),
            strategy: strategy.to_string(),
            profile: profile.to_string(),
        }
    }

    async fn router_with(
        rules: Vec<RouteConfig>,
    ) -> (Router, Arc<RecordingProcessor>, TempDir) {
        let dir = TempDir::new().unwrap();
        let sessions = SessionStore::open(dir.path()).await.unwrap();
        let processor = RecordingProcessor::new();
        let (bp_tx, _bp_rx) = mpsc::channel(16);
        let queues = QueueManager::new(
            processor.clone(),
            QueueConfig {
                max_depth: 16,
                idle_timeout_seconds: 60,
                reorder_timeout_ms: 200,
            },
            bp_tx,
        );
        let table = RoutingTable::compile(&rules).unwrap();
        let router = Router::new(table, &DedupConfig { window_seconds: 300 }, sessions, queues);
        (router, processor, dir)
    }

    fn message(channel: &str, conversation: &str, seq: u64) -> Message {
        Message::inbound_text(
            channel,
            conversation,
            Sender {
                id: "u1".to_string(),
                display_name: None,
            },
            "hello",
            seq,
        )
    }

    async fn wait_until(processor: &RecordingProcessor, want: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while processor.seen().len() < want {
                processor.done.notified().await;
            }
        })
        .await
        .expect("processor did not drain in time");
    }

    #[tokio::test]
    async fn routes_to_matching_rule() {
        let (router, processor, _dir) = router_with(vec![route_config(
            "loopback",
            "*",
            "per_conversation",
            "default",
        )])
        .await;

        let outcome = router
            .route(
                message("loopback:demo", "conv-1", 1),
                None,
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Admitted(AdmitOutcome::Enqueued));

        wait_until(&processor, 1).await;
        assert_eq!(processor.seen(), vec!["loopback_demo--conv-1:1"]);
    }

    #[tokio::test]
    async fn duplicate_id_has_no_second_effect() {
        let (router, processor, _dir) = router_with(vec![route_config(
            "loopback",
            "*",
            "per_conversation",
            "default",
        )])
        .await;

        let original = message("loopback:demo", "conv-1", 1);
        let mut replay = message("loopback:demo", "conv-1", 2);
        replay.id = original.id.clone();

        router
            .route(original, None, false, CancellationToken::new())
            .await
            .unwrap();
        let outcome = router
            .route(replay, None, false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Duplicate);

        wait_until(&processor, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.seen().len(), 1);
    }

    #[tokio::test]
    async fn unroutable_message_dead_lettered() {
        let (router, _processor, dir) = router_with(vec![route_config(
            "telegram",
            "*",
            "per_conversation",
            "default",
        )])
        .await;

        let outcome = router
            .route(
                message("loopback:demo", "conv-1", 1),
                None,
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::DeadLettered);

        let content =
            std::fs::read_to_string(dir.path().join("dead_letter.jsonl")).unwrap();
        assert!(content.contains("no matching routing rule"));
    }

    #[tokio::test]
    async fn account_pattern_selects_profile() {
        let (router, processor, _dir) = router_with(vec![
            route_config("loopback", "support-*", "per_conversation", "support"),
            route_config("loopback", "*", "per_conversation", "default"),
        ])
        .await;

        router
            .route(
                message("loopback:support-eu", "conv-1", 1),
                None,
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        wait_until(&processor, 1).await;

        // Profile is visible through the session the rule created.
        let session_id = processor.seen()[0].split(':').next().unwrap().to_string();
        assert!(session_id.starts_with("loopback_support-eu--"));
    }

    #[tokio::test]
    async fn per_account_strategy_shares_one_session() {
        let (router, processor, _dir) = router_with(vec![route_config(
            "loopback",
            "*",
            "per_account",
            "default",
        )])
        .await;

        router
            .route(
                message("loopback:demo", "conv-1", 1),
                None,
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        router
            .route(
                message("loopback:demo", "conv-2", 1),
                None,
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        wait_until(&processor, 2).await;
        let seen = processor.seen();
        let sessions: std::collections::HashSet<_> = seen
            .iter()
            .map(|s| s.split(':').next().unwrap())
            .collect();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn reload_swaps_rules() {
        let (router, _processor, dir) = router_with(vec![route_config(
            "telegram",
            "*",
            "per_conversation",
            "default",
        )])
        .await;

        let table = RoutingTable::compile(&[route_config(
            "loopback",
            "*",
            "per_conversation",
            "default",
        )])
        .unwrap();
        router.reload(table);

        let outcome = router
            .route(
                message("loopback:demo", "conv-1", 1),
                None,
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Admitted(AdmitOutcome::Enqueued));
        assert!(!dir.path().join("dead_letter.jsonl").exists());
    }

    #[tokio::test]
    async fn retry_after_storage_failure_is_admitted() {
        let (router, processor, dir) = router_with(vec![route_config(
            "loopback",
            "*",
            "per_conversation",
            "default",
        )])
        .await;

        // Occupy the session's snapshot path with a directory so resolution
        // fails at persist time.
        let blocked = dir.path().join("loopback_demo--conv-1.meta.json");
        std::fs::create_dir(&blocked).unwrap();

        let original = message("loopback:demo", "conv-1", 1);
        let retry = original.clone();
        let result = router
            .route(original, None, false, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RoutingError::Storage(_))));

        // The connector retries the same message id once storage recovers;
        // it must be admitted, not swallowed as a replay.
        std::fs::remove_dir(&blocked).unwrap();
        let outcome = router
            .route(retry, None, false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Admitted(AdmitOutcome::Enqueued));
        wait_until(&processor, 1).await;
    }

    #[test]
    fn unknown_strategy_rejected_at_compile() {
        let err = RoutingTable::compile(&[route_config(
            "loopback",
            "*",
            "round_robin",
            "default",
        )])
        .err()
        .unwrap();
        assert!(matches!(err, RoutingError::InvalidStrategy { .. }));
    }
}
