//! TTL cache for validated bearer headers
//!
//! Customers hitting their deployments with a fixed `Authorization` header
//! (automation, schedulers) would otherwise cost one identity-service round
//! trip per request. A positive verification is remembered per
//! `(target, header)` pair for the access-key expiration window. The cache
//! is purely advisory: absence forces revalidation, presence implies trust
//! until the entry expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

/// Cache key for a `(target, authorization header)` pair
pub fn cache_key(target: &str, auth_header: &str) -> String {
    format!("{}/{}", target, auth_header)
}

/// Bounded-lifetime set of verified bearer keys
#[derive(Debug)]
pub struct BearerCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl BearerCache {
    /// Create a cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the key is present and not yet expired
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// Record a verified key
    pub fn insert(&self, key: String) {
        let deadline = Instant::now() + self.ttl;
        self.entries.lock().unwrap().insert(key, deadline);
    }

    /// Drop expired entries; called periodically by the janitor task
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, deadline| *deadline > now);
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, remaining = entries.len(), "Purged expired bearer cache entries");
        }
    }

    /// Number of entries, including any not yet purged
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the cache holds no entries at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run the sweep loop until the task is aborted. The sweep period equals the
/// TTL; finer granularity buys nothing since lookups already check deadlines.
pub async fn run_janitor(cache: Arc<BearerCache>) {
    let mut interval = tokio::time::interval(cache.ttl);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        cache.purge_expired();
    }
}
