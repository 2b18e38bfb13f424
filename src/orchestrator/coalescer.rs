//! In-flight request deduplication.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::Session;

/// Result of trying to register a session under its cache key.
pub enum Claim {
    /// The key was free; the caller owns the execution.
    Claimed,
    /// Another session is already in flight; attach to its defer.
    Joined(Arc<Session>),
}

/// Mapping from cache key to the single in-flight session. All mutations
/// happen from the orchestrator's execution context; the lock only guards
/// the map itself and is never held across a suspension point.
#[derive(Default)]
pub struct Coalescer {
    inflight: Mutex<HashMap<String, Arc<Session>>>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, session: &Arc<Session>) -> Claim {
        let mut map = self.inflight.lock();
        if let Some(existing) = map.get(&session.cache_key) {
            return Claim::Joined(existing.clone());
        }
        map.insert(session.cache_key.clone(), session.clone());
        Claim::Claimed
    }

    pub fn get(&self, cache_key: &str) -> Option<Arc<Session>> {
        self.inflight.lock().get(cache_key).cloned()
    }

    pub fn remove(&self, cache_key: &str) {
        self.inflight.lock().remove(cache_key);
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }
}
