//! Keyed async locks.
//!
//! Hands out one `Mutex` per string key so callers can serialize work on a
//! per-session basis without a global lock. Entries are created lazily and
//! never removed; the number of live sessions bounds the map.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// A map of independently lockable keys.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock for a key.
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for a key. Outstanding guards keep their `Arc`.
    pub fn remove(&self, key: &str) {
        self.locks.remove(key);
    }
}
