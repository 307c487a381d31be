//! Inbound dedup (§4.7): a TTL-bounded map of seen message ids, keyed by
//! [`crate::model::InboundFrame::dedup_key`].

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Seen-message tracker. `check` is the only entry point: it reports
/// whether a key has already been seen (and is still live) and, on a
/// miss, records it.
pub struct Dedup {
    ttl_ms: i64,
    max_size: usize,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Dedup {
    /// Build a dedup tracker with the given per-entry TTL and max size.
    #[must_use]
    pub fn new(ttl_ms: i64, max_size: usize) -> Self {
        Self {
            ttl_ms,
            max_size,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` iff `key` was already recorded and its TTL has not
    /// yet elapsed. On a miss, records `key` at the current time, evicting
    /// the oldest entry first if the map is at capacity.
    #[must_use]
    pub fn check(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut seen = self.seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        seen.retain(|_, inserted_at| (now - *inserted_at).num_milliseconds() < self.ttl_ms);

        if seen.contains_key(key) {
            return true;
        }

        if seen.len() >= self.max_size {
            if let Some(oldest) = seen.iter().min_by_key(|(_, t)| **t).map(|(k, _)| k.clone()) {
                seen.remove(&oldest);
            }
        }
        seen.insert(key.to_owned(), now);
        false
    }

    /// Current tracked-entry count, for diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Whether the tracker currently holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
