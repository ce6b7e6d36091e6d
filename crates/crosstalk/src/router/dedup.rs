//! Message-id deduplication window.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::{Duration, Instant};

/// Remembers message ids for a retention window.
///
/// Connectors retry deliveries; a replayed id within the window must produce
/// no second effect on session history. Expired ids are pruned lazily on
/// insert, keeping the hot path to one lock and one map operation.
pub struct DedupCache {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this id already had its effect within the window.
    pub fn is_replay(&self, message_id: &str) -> bool {
        self.prune().contains_key(message_id)
    }

    /// Record an id once its message has been admitted. Ids are deliberately
    /// not recorded for failed or dead-lettered messages, so a connector's
    /// retry after a transient failure is not swallowed as a replay.
    pub fn record(&self, message_id: &str) {
        self.prune().insert(message_id.to_string(), Instant::now());
    }

    fn prune(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.retain(|_, seen_at| now.duration_since(*seen_at) < self.window);
        seen
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or(0)
    }
}
