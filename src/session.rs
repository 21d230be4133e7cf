//! Active proxy session membership
//!
//! The identity service records every live proxy session as a key in a
//! ConfigMap; the watcher feeds that ConfigMap here. A validated token whose
//! subject is missing from this set is rejected, which gives the control
//! plane an immediate kill switch for any session.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use tracing::info;

/// Set of active session identifiers
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashSet<String>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the subject has an active session
    pub fn contains(&self, subject: &str) -> bool {
        self.sessions.lock().unwrap().contains(subject)
    }

    /// Replace the session set with the ConfigMap's keys.
    ///
    /// Returns whether anything changed; unchanged resync payloads are
    /// swallowed silently to keep the logs quiet.
    pub fn load(&self, data: BTreeMap<String, String>) -> bool {
        let incoming: HashSet<String> = data.into_keys().collect();

        let mut sessions = self.sessions.lock().unwrap();
        if *sessions == incoming {
            return false;
        }
        info!(count = incoming.len(), "Loaded user sessions");
        *sessions = incoming;
        true
    }

    /// Drop every session (the backing ConfigMap was deleted)
    pub fn clear(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        if !sessions.is_empty() {
            sessions.clear();
            info!("Deleted user sessions");
        }
    }
}
