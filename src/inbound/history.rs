//! History Aggregator (§4.8): a per-conversation bounded buffer of
//! gated-out messages, flushed into a single envelope once a later
//! message is allowed through.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::HistoryEntry;

/// Per-conversation pending-history store, bounded at `limit` entries per
/// key with oldest-first eviction.
pub struct HistoryAggregator {
    limit: usize,
    entries: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

impl HistoryAggregator {
    /// Build an aggregator retaining up to `limit` entries per conversation.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a gated-out message against `conversation_key`, evicting the
    /// oldest entry if the conversation is already at `limit`.
    pub fn record(&self, conversation_key: &str, entry: HistoryEntry) {
        let mut map = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let list = map.entry(conversation_key.to_owned()).or_default();
        list.push(entry);
        if list.len() > self.limit {
            let excess = list.len() - self.limit;
            list.drain(0..excess);
        }
    }

    /// Take and clear the pending history for `conversation_key`, formatted
    /// as a single envelope (one line per entry) to prepend ahead of the
    /// message that was finally allowed through. Returns `None` if there
    /// was no pending history.
    #[must_use]
    pub fn take_envelope(&self, conversation_key: &str) -> Option<String> {
        let mut map = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entries = map.remove(conversation_key)?;
        if entries.is_empty() {
            return None;
        }
        Some(
            entries
                .iter()
                .map(format_entry)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Number of pending entries for a conversation, without clearing them.
    #[must_use]
    pub fn pending_count(&self, conversation_key: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(conversation_key)
            .map_or(0, Vec::len)
    }
}

fn format_entry(entry: &HistoryEntry) -> String {
    format!("{}: {}", entry.sender, entry.body)
}
