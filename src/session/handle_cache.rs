//! Runtime Handle Cache (§4.2): caches opened ACP runtime handles keyed by
//! session, tracking last-touched time and an opaque applied-control
//! signature so the manager can skip reapplying unchanged `runtimeOptions`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::acp::{BackendHandleRef, RuntimeBackend};

/// An in-memory handle to an opened runtime session (§3). The manager
/// exclusively owns handles; the runtime backend itself is a polymorphic
/// collaborator behind `Arc<dyn RuntimeBackend>`.
#[derive(Clone)]
pub struct RuntimeHandle {
    /// The backend implementation this handle was opened against.
    pub runtime: Arc<dyn RuntimeBackend>,
    /// The session key this handle belongs to.
    pub session_key: String,
    /// Backend id.
    pub backend: String,
    /// Agent identity.
    pub agent: String,
    /// Persistent vs. oneshot.
    pub mode: crate::model::SessionMode,
    /// Working directory, if any.
    pub cwd: Option<String>,
    /// Backend-local handle name.
    pub runtime_session_name: String,
    /// Backend session id, once known.
    pub backend_session_id: Option<String>,
    /// Agent session id, once known.
    pub agent_session_id: Option<String>,
    /// Last time this handle was touched by any operation.
    pub last_touched_at: DateTime<Utc>,
    /// Opaque digest of the last-applied `runtimeOptions` (§4.5.3).
    pub applied_control_signature: Option<String>,
}

impl RuntimeHandle {
    /// The `(backend, agent, mode, cwd)` tuple used to decide whether a
    /// cached handle can be reused for a new `runTurn` call.
    #[must_use]
    pub fn matches(&self, backend: &str, agent: &str, mode: crate::model::SessionMode, cwd: Option<&str>) -> bool {
        self.backend == backend
            && self.agent == agent
            && self.mode == mode
            && self.cwd.as_deref() == cwd
    }

    /// Build the manager-side handle reference passed to every backend call.
    #[must_use]
    pub fn to_backend_ref(&self) -> BackendHandleRef {
        BackendHandleRef {
            session_key: self.session_key.clone(),
            agent: self.agent.clone(),
            mode: self.mode,
            cwd: self.cwd.clone(),
            runtime_session_name: self.runtime_session_name.clone(),
            backend_session_id: self.backend_session_id.clone(),
            agent_session_id: self.agent_session_id.clone(),
        }
    }
}

/// A candidate handle selected for idle eviction, paired with its key.
pub struct IdleCandidate {
    /// Session key owning the candidate handle.
    pub session_key: String,
    /// The candidate handle.
    pub handle: RuntimeHandle,
}

/// In-memory cache of opened runtime handles.
#[derive(Default)]
pub struct RuntimeHandleCache {
    handles: RwLock<HashMap<String, RuntimeHandle>>,
}

impl RuntimeHandleCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the handle for `session_key`, refreshing `lastTouchedAt`.
    pub async fn get(&self, session_key: &str) -> Option<RuntimeHandle> {
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get_mut(session_key) {
            handle.last_touched_at = Utc::now();
            return Some(handle.clone());
        }
        None
    }

    /// Look up the handle for `session_key` without affecting idle
    /// accounting (§4.2 `peek`).
    pub async fn peek(&self, session_key: &str) -> Option<RuntimeHandle> {
        let handles = self.handles.read().await;
        handles.get(session_key).cloned()
    }

    /// Insert or replace the handle for `session_key`.
    pub async fn set(&self, session_key: &str, handle: RuntimeHandle) {
        let mut handles = self.handles.write().await;
        handles.insert(session_key.to_owned(), handle);
    }

    /// Remove and return the handle for `session_key`, if any.
    pub async fn clear(&self, session_key: &str) -> Option<RuntimeHandle> {
        let mut handles = self.handles.write().await;
        handles.remove(session_key)
    }

    /// Whether a handle is currently cached for `session_key`.
    pub async fn has(&self, session_key: &str) -> bool {
        let handles = self.handles.read().await;
        handles.contains_key(session_key)
    }

    /// Number of cached handles — the figure admission control compares
    /// against `maxConcurrentSessions`.
    pub async fn size(&self) -> usize {
        let handles = self.handles.read().await;
        handles.len()
    }

    /// Candidates idle longer than `max_idle_ms`, stable-ordered by
    /// ascending `lastTouchedAt` (stalest first) — the manager (not this
    /// cache) is responsible for actually closing and removing them.
    pub async fn collect_idle_candidates(
        &self,
        max_idle_ms: i64,
        now: DateTime<Utc>,
    ) -> Vec<IdleCandidate> {
        let handles = self.handles.read().await;
        let mut candidates: Vec<IdleCandidate> = handles
            .iter()
            .filter(|(_, handle)| {
                (now - handle.last_touched_at).num_milliseconds() >= max_idle_ms
            })
            .map(|(key, handle)| IdleCandidate {
                session_key: key.clone(),
                handle: handle.clone(),
            })
            .collect();
        candidates.sort_by_key(|c| c.handle.last_touched_at);
        candidates
    }
}
