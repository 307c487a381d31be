//! ACP Session Manager (§4.5): orchestrates ensure/run/cancel/close/status
//! over the actor queue, runtime handle cache, metadata store, and backend
//! registry. Enforces admission control, reconciles identity, and records
//! observability.
//!
//! This is the one process-wide collaborator the rest of the crate talks
//! to — the inbound dispatcher (§4.10) drives `run_turn`/`cancel_session`,
//! while a control surface (a CLI, an HTTP handler) would drive the
//! `set_session_*` family. Per §9 ("Global state"), a fresh instance can
//! always be constructed — nothing here is a lazy static — so tests build
//! one per case instead of reaching for a reset hook.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::acp::{BackendRegistry, EnsureSessionRequest, RunTurnRequest};
use crate::config::{AcpConfig, GlobalConfig};
use crate::errors::AcpErrorCode;
use crate::model::{
    is_acp_shaped, IdentityState, ResolvedSession, RuntimeCapabilities, RuntimeEvent,
    RuntimeOptions, RuntimeStatus, SessionAcpMeta, SessionMode, SessionState, TurnMode,
};
use crate::persistence::metadata_store::SessionMetadataStore;
use crate::session::{identity, ActorQueue, RuntimeHandle, RuntimeHandleCache};
use crate::{AppError, Result};
use tokio::sync::Mutex;

/// `getSessionStatus` response (§4.5).
#[derive(Debug, Clone)]
pub struct SessionStatusView {
    /// Backend id owning the session.
    pub backend: String,
    /// Agent identity routed to.
    pub agent: String,
    /// Reconciled identity, if any has been observed.
    pub identity: Option<crate::model::SessionIdentity>,
    /// Current state-machine state.
    pub state: SessionState,
    /// Persistent vs. oneshot.
    pub mode: SessionMode,
    /// Persisted runtime options.
    pub runtime_options: RuntimeOptions,
    /// Backend-advertised capabilities.
    pub capabilities: RuntimeCapabilities,
    /// Backend status snapshot, if the backend supports `getStatus`.
    pub runtime_status: Option<RuntimeStatus>,
    /// Timestamp of the most recent activity.
    pub last_activity_at: DateTime<Utc>,
    /// Last turn failure message, if any.
    pub last_error: Option<String>,
}

/// `reconcilePendingSessionIdentities` report (§4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileReport {
    /// Sessions with `identity.state = pending` examined.
    pub checked: u64,
    /// Of those, how many transitioned to `resolved`.
    pub resolved: u64,
    /// Of those, how many failed (swallowed, not propagated).
    pub failed: u64,
}

/// `runtimeCache` portion of the observability snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeCacheSnapshot {
    /// Currently cached runtime handles.
    pub active_sessions: usize,
    /// Configured idle TTL, in milliseconds.
    pub idle_ttl_ms: i64,
    /// Total handles evicted over the manager's lifetime.
    pub evicted_total: u64,
    /// Timestamp of the most recent eviction, if any.
    pub last_evicted_at: Option<DateTime<Utc>>,
}

/// `turns` portion of the observability snapshot.
#[derive(Debug, Clone, Copy)]
pub struct TurnsSnapshot {
    /// Turns currently in flight.
    pub active: usize,
    /// Total operations enqueued or executing across all actor lanes.
    pub queue_depth: usize,
    /// Turns completed successfully over the manager's lifetime.
    pub completed: u64,
    /// Turns that ended in error over the manager's lifetime.
    pub failed: u64,
    /// Mean turn latency in milliseconds.
    pub average_latency_ms: f64,
    /// Maximum observed turn latency in milliseconds.
    pub max_latency_ms: u64,
}

/// `getObservabilitySnapshot` response (§4.5).
#[derive(Debug, Clone)]
pub struct ObservabilitySnapshot {
    /// Runtime handle cache stats.
    pub runtime_cache: RuntimeCacheSnapshot,
    /// Turn execution stats.
    pub turns: TurnsSnapshot,
    /// Error counts keyed by the stable ACP error code string.
    pub errors_by_code: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Metrics {
    turns_completed: u64,
    turns_failed: u64,
    total_latency_ms: u64,
    max_latency_ms: u64,
    errors_by_code: HashMap<AcpErrorCode, u64>,
    evicted_total: u64,
    last_evicted_at: Option<DateTime<Utc>>,
}

impl Metrics {
    fn record_turn(&mut self, latency_ms: u64, success: bool) {
        if success {
            self.turns_completed += 1;
        } else {
            self.turns_failed += 1;
        }
        self.total_latency_ms += latency_ms;
        self.max_latency_ms = self.max_latency_ms.max(latency_ms);
    }

    fn average_latency_ms(&self) -> f64 {
        let total = self.turns_completed + self.turns_failed;
        if total == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / total as f64
        }
    }
}

fn normalize_error_code(raw: &str) -> AcpErrorCode {
    match raw {
        "ACP_SESSION_INIT_FAILED" => AcpErrorCode::SessionInitFailed,
        "ACP_BACKEND_MISSING" => AcpErrorCode::BackendMissing,
        "ACP_BACKEND_UNAVAILABLE" => AcpErrorCode::BackendUnavailable,
        "ACP_BACKEND_UNSUPPORTED_CONTROL" => AcpErrorCode::UnsupportedControl,
        "ACP_INVALID_RUNTIME_OPTION" => AcpErrorCode::InvalidRuntimeOption,
        "ACP_DISPATCH_DISABLED" => AcpErrorCode::DispatchDisabled,
        _ => AcpErrorCode::TurnFailed,
    }
}

fn apply_named_option(opts: &mut RuntimeOptions, key: &str, value: &Value) -> Result<()> {
    match key {
        "model" => opts.model = value.as_str().map(str::to_owned),
        "permissionProfile" => opts.permission_profile = value.as_str().map(str::to_owned),
        "timeoutSeconds" => {
            let secs = value.as_u64().filter(|v| *v > 0).ok_or_else(|| {
                AppError::acp(
                    AcpErrorCode::InvalidRuntimeOption,
                    "timeoutSeconds must be a positive integer",
                )
            })?;
            opts.timeout_seconds = Some(secs);
        }
        "cwd" => {
            let cwd = value.as_str().ok_or_else(|| {
                AppError::acp(AcpErrorCode::InvalidRuntimeOption, "cwd must be a string")
            })?;
            GlobalConfig::validate_cwd(cwd)?;
            opts.cwd = Some(cwd.to_owned());
        }
        other => {
            return Err(AppError::acp(
                AcpErrorCode::UnsupportedControl,
                format!("unknown runtime config option '{other}'"),
            ));
        }
    }
    Ok(())
}

/// Orchestrates the full ACP session lifecycle described in §4.5.
pub struct AcpSessionManager {
    actor_queue: ActorQueue,
    handle_cache: RuntimeHandleCache,
    metadata_store: SessionMetadataStore,
    registry: BackendRegistry,
    active_turns: Mutex<HashMap<String, CancellationToken>>,
    cancel_memo: Mutex<HashSet<String>>,
    metrics: Mutex<Metrics>,
}

impl AcpSessionManager {
    /// Build a fresh manager over the given metadata store and backend
    /// registry. No shared singleton state — every call site (including
    /// tests) constructs its own instance.
    #[must_use]
    pub fn new(metadata_store: SessionMetadataStore, registry: BackendRegistry) -> Self {
        Self {
            actor_queue: ActorQueue::new(),
            handle_cache: RuntimeHandleCache::new(),
            metadata_store,
            registry,
            active_turns: Mutex::new(HashMap::new()),
            cancel_memo: Mutex::new(HashSet::new()),
            metrics: Mutex::new(Metrics::default()),
        }
    }

    async fn resolve_session_inner(&self, session_key: &str) -> Result<ResolvedSession> {
        match self.metadata_store.read(session_key).await? {
            Some(meta) => Ok(ResolvedSession::Ready(meta)),
            None if is_acp_shaped(session_key) => Ok(ResolvedSession::Stale),
            None => Ok(ResolvedSession::None),
        }
    }

    /// §4.5 `resolveSession`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the metadata store read fails.
    pub async fn resolve_session(&self, session_key: &str) -> Result<ResolvedSession> {
        self.resolve_session_inner(session_key).await
    }

    /// §4.5, §5 ("Idle eviction"): evict every handle idle past
    /// `ttlMinutes`, closing each under its own session actor so an
    /// in-flight turn can never be evicted out from under itself.
    #[instrument(skip(self, cfg))]
    pub async fn evict_idle_runtime_handles(&self, cfg: &AcpConfig) {
        let ttl_ms = (cfg.runtime.ttl_minutes * 60_000.0) as i64;
        let now = Utc::now();
        let candidates = self.handle_cache.collect_idle_candidates(ttl_ms, now).await;
        for candidate in candidates {
            let key = candidate.session_key;
            self.actor_queue
                .run(&key, || async {
                    // Re-peek under the actor lock: a concurrently-enqueued
                    // operation may have refreshed or removed this handle
                    // while we were waiting for the lane.
                    let Some(current) = self.handle_cache.peek(&key).await else {
                        return;
                    };
                    if (Utc::now() - current.last_touched_at).num_milliseconds() < ttl_ms {
                        return;
                    }
                    if let Ok(runtime) = self.registry.resolve(&current.backend) {
                        if let Err(err) = runtime.close(&current.to_backend_ref(), "idle-evicted").await {
                            warn!(session_key = %key, %err, "idle eviction close failed; dropping cache slot anyway");
                        }
                    }
                    self.handle_cache.clear(&key).await;
                    let mut metrics = self.metrics.lock().await;
                    metrics.evicted_total += 1;
                    metrics.last_evicted_at = Some(Utc::now());
                })
                .await;
        }
    }

    /// Reuse the cached handle for `session_key` iff `(backend, agent,
    /// mode, cwd)` still match; otherwise clear the stale entry and
    /// re-ensure under admission control (§4.5.1), reconciling identity
    /// from the fresh `ensureSession` result. Shared by `runTurn`,
    /// `getSessionStatus`, and the `setSession*` family.
    async fn ensure_handle_for(&self, cfg: &AcpConfig, session_key: &str, meta: &SessionAcpMeta) -> Result<RuntimeHandle> {
        let cwd = meta.cwd.clone().or_else(|| meta.runtime_options.cwd.clone());

        if let Some(existing) = self.handle_cache.get(session_key).await {
            if existing.matches(&meta.backend, &meta.agent, meta.mode, cwd.as_deref()) {
                return Ok(existing);
            }
            self.handle_cache.clear(session_key).await;
        }

        if self.handle_cache.size().await >= cfg.max_concurrent_sessions as usize {
            return Err(AppError::acp(
                AcpErrorCode::SessionInitFailed,
                "max concurrent sessions reached",
            ));
        }

        let runtime = self.registry.resolve(&meta.backend)?;
        let ensure_result = runtime
            .ensure_session(EnsureSessionRequest {
                session_key: session_key.to_owned(),
                agent: meta.agent.clone(),
                mode: meta.mode,
                cwd: cwd.clone(),
            })
            .await?;

        let incoming = identity::from_ensure(
            ensure_result.backend_session_id.clone(),
            ensure_result.agent_session_id.clone(),
        );
        let merged = identity::reconcile(meta.identity.as_ref(), &incoming);
        self.metadata_store
            .upsert(session_key, |current| {
                current.map(|c| {
                    let mut next = c.clone();
                    next.identity = Some(merged.clone());
                    next
                })
            })
            .await?;

        let handle = RuntimeHandle {
            runtime,
            session_key: session_key.to_owned(),
            backend: meta.backend.clone(),
            agent: meta.agent.clone(),
            mode: meta.mode,
            cwd,
            runtime_session_name: ensure_result.runtime_session_name,
            backend_session_id: ensure_result.backend_session_id,
            agent_session_id: ensure_result.agent_session_id,
            last_touched_at: Utc::now(),
            applied_control_signature: None,
        };
        self.handle_cache.set(session_key, handle.clone()).await;
        Ok(handle)
    }

    /// §4.5 `initializeSession`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` (`InvalidRuntimeOption`, `SessionInitFailed`)
    /// or a backend/persistence error. On a metadata-persistence failure
    /// the just-ensured runtime handle is closed before the error
    /// propagates — no orphan runtime handles survive a failed init.
    #[instrument(skip(self, cfg))]
    pub async fn initialize_session(
        &self,
        cfg: &AcpConfig,
        session_key: &str,
        agent: &str,
        mode: SessionMode,
        cwd: Option<&str>,
        backend_id: Option<&str>,
    ) -> Result<SessionAcpMeta> {
        if let Some(c) = cwd {
            GlobalConfig::validate_cwd(c)?;
        }
        self.evict_idle_runtime_handles(cfg).await;

        let key = session_key.to_owned();
        let backend = backend_id.unwrap_or(&cfg.backend).to_owned();
        let agent = agent.to_owned();
        let cwd = cwd.map(str::to_owned);

        self.actor_queue
            .run(&key, || async {
                if self.handle_cache.size().await >= cfg.max_concurrent_sessions as usize {
                    return Err(AppError::acp(
                        AcpErrorCode::SessionInitFailed,
                        "max concurrent sessions reached",
                    ));
                }

                let runtime = self.registry.resolve(&backend)?;
                let ensure_result = runtime
                    .ensure_session(EnsureSessionRequest {
                        session_key: key.clone(),
                        agent: agent.clone(),
                        mode,
                        cwd: cwd.clone(),
                    })
                    .await
                    .map_err(|err| AppError::acp(AcpErrorCode::SessionInitFailed, format!("ensureSession failed: {err}")))?;

                let identity = identity::from_ensure(
                    ensure_result.backend_session_id.clone(),
                    ensure_result.agent_session_id.clone(),
                );
                let meta = SessionAcpMeta {
                    backend: backend.clone(),
                    agent: agent.clone(),
                    runtime_session_name: ensure_result.runtime_session_name.clone(),
                    identity: Some(identity),
                    mode,
                    runtime_options: RuntimeOptions::default(),
                    cwd: cwd.clone(),
                    state: SessionState::Idle,
                    last_activity_at: Utc::now(),
                    last_error: None,
                };

                let handle = RuntimeHandle {
                    runtime: Arc::clone(&runtime),
                    session_key: key.clone(),
                    backend: backend.clone(),
                    agent: agent.clone(),
                    mode,
                    cwd: cwd.clone(),
                    runtime_session_name: ensure_result.runtime_session_name,
                    backend_session_id: ensure_result.backend_session_id,
                    agent_session_id: ensure_result.agent_session_id,
                    last_touched_at: Utc::now(),
                    applied_control_signature: None,
                };

                match self.metadata_store.upsert(&key, |_| Some(meta.clone())).await {
                    Ok(_) => {
                        self.handle_cache.set(&key, handle).await;
                        Ok(meta)
                    }
                    Err(err) => {
                        let _ = runtime.close(&handle.to_backend_ref(), "init-meta-failed").await;
                        Err(err)
                    }
                }
            })
            .await
    }

    /// §4.5 `getSessionStatus`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` (`SessionInitFailed`) if metadata is
    /// missing, or a backend/persistence error.
    #[instrument(skip(self, cfg))]
    pub async fn get_session_status(&self, cfg: &AcpConfig, session_key: &str) -> Result<SessionStatusView> {
        self.evict_idle_runtime_handles(cfg).await;
        let key = session_key.to_owned();

        self.actor_queue
            .run(&key, || async {
                let meta = match self.resolve_session_inner(&key).await? {
                    ResolvedSession::Ready(meta) => meta,
                    _ => {
                        return Err(AppError::acp(AcpErrorCode::SessionInitFailed, "ACP metadata is missing"));
                    }
                };

                let handle = self.ensure_handle_for(cfg, &key, &meta).await?;
                let capabilities = handle
                    .runtime
                    .get_capabilities(&handle.to_backend_ref())
                    .await
                    .unwrap_or_default();
                let runtime_status = handle.runtime.get_status(&handle.to_backend_ref()).await.ok().flatten();

                if let Some(status) = &runtime_status {
                    let incoming = identity::from_status(
                        status.backend_session_id.clone(),
                        status.agent_session_id.clone(),
                        status.acpx_record_id.clone(),
                    );
                    self.metadata_store
                        .upsert(&key, |current| {
                            current.map(|c| {
                                let mut next = c.clone();
                                next.identity = Some(identity::reconcile(next.identity.as_ref(), &incoming));
                                next
                            })
                        })
                        .await?;
                }

                let refreshed = self.metadata_store.read(&key).await?.unwrap_or(meta);
                Ok(SessionStatusView {
                    backend: refreshed.backend,
                    agent: refreshed.agent,
                    identity: refreshed.identity,
                    state: refreshed.state,
                    mode: refreshed.mode,
                    runtime_options: refreshed.runtime_options,
                    capabilities,
                    runtime_status,
                    last_activity_at: refreshed.last_activity_at,
                    last_error: refreshed.last_error,
                })
            })
            .await
    }

    async fn ensure_capability_handle(&self, cfg: &AcpConfig, session_key: &str) -> Result<(SessionAcpMeta, RuntimeHandle)> {
        let meta = match self.resolve_session_inner(session_key).await? {
            ResolvedSession::Ready(meta) => meta,
            _ => return Err(AppError::acp(AcpErrorCode::SessionInitFailed, "ACP metadata is missing")),
        };
        let handle = self.ensure_handle_for(cfg, session_key, &meta).await?;
        Ok((meta, handle))
    }

    /// §4.5 `setSessionRuntimeMode`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` (`InvalidRuntimeOption` for an empty mode,
    /// `UnsupportedControl` if the backend doesn't advertise `setMode`).
    pub async fn set_session_runtime_mode(&self, cfg: &AcpConfig, session_key: &str, mode: &str) -> Result<()> {
        if mode.trim().is_empty() {
            return Err(AppError::acp(AcpErrorCode::InvalidRuntimeOption, "runtime mode must be non-empty"));
        }
        let key = session_key.to_owned();
        let mode = mode.to_owned();

        self.actor_queue
            .run(&key, || async {
                let (meta, handle) = self.ensure_capability_handle(cfg, &key).await?;
                let caps = handle.runtime.get_capabilities(&handle.to_backend_ref()).await.unwrap_or_default();
                if !caps.supports("setMode") {
                    return Err(AppError::acp(AcpErrorCode::UnsupportedControl, "backend does not support setMode"));
                }
                handle.runtime.set_mode(&handle.to_backend_ref(), &mode).await?;

                let mut patch = RuntimeOptions::default();
                patch.runtime_mode = Some(mode);
                let merged = meta.runtime_options.merged_with(&patch);
                self.persist_runtime_options_and_invalidate_signature(&key, &handle, merged).await
            })
            .await
    }

    /// §4.5 `setSessionConfigOption`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` (`UnsupportedControl` if the backend
    /// doesn't accept the key, `InvalidRuntimeOption` if the value fails
    /// validation for a known key like `cwd`/`timeoutSeconds`).
    pub async fn set_session_config_option(&self, cfg: &AcpConfig, session_key: &str, key_name: &str, value: &Value) -> Result<()> {
        let key = session_key.to_owned();
        let key_name = key_name.to_owned();
        let value = value.clone();

        self.actor_queue
            .run(&key, || async {
                let (meta, handle) = self.ensure_capability_handle(cfg, &key).await?;
                let caps = handle.runtime.get_capabilities(&handle.to_backend_ref()).await.unwrap_or_default();
                if !caps.supports("setConfigOption") || !caps.accepts_config_key(&key_name) {
                    return Err(AppError::acp(
                        AcpErrorCode::UnsupportedControl,
                        format!("backend does not accept config option '{key_name}'"),
                    ));
                }
                handle.runtime.set_config_option(&handle.to_backend_ref(), &key_name, &value).await?;

                let mut patch = RuntimeOptions::default();
                apply_named_option(&mut patch, &key_name, &value)?;
                let merged = meta.runtime_options.merged_with(&patch);
                self.persist_runtime_options_and_invalidate_signature(&key, &handle, merged).await
            })
            .await
    }

    async fn persist_runtime_options_and_invalidate_signature(
        &self,
        session_key: &str,
        handle: &RuntimeHandle,
        merged: RuntimeOptions,
    ) -> Result<()> {
        self.metadata_store
            .upsert(session_key, |current| {
                current.map(|c| {
                    let mut next = c.clone();
                    next.runtime_options = merged.clone();
                    next
                })
            })
            .await?;
        let mut updated = handle.clone();
        updated.applied_control_signature = None;
        self.handle_cache.set(session_key, updated).await;
        Ok(())
    }

    /// §4.5 `updateSessionRuntimeOptions`: merge `patch` into the
    /// persisted options. A `cwd` change invalidates the cached handle
    /// (I4); any other change merely resets the applied-control signature
    /// so the next `runTurn` reapplies.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` (`InvalidRuntimeOption`, `SessionInitFailed`)
    /// or a persistence error.
    pub async fn update_session_runtime_options(&self, session_key: &str, patch: RuntimeOptions) -> Result<()> {
        if let Some(secs) = patch.timeout_seconds {
            if secs == 0 {
                return Err(AppError::acp(AcpErrorCode::InvalidRuntimeOption, "timeoutSeconds must be a positive integer"));
            }
        }
        if let Some(cwd) = &patch.cwd {
            GlobalConfig::validate_cwd(cwd)?;
        }

        let key = session_key.to_owned();
        self.actor_queue
            .run(&key, || async {
                let meta = match self.resolve_session_inner(&key).await? {
                    ResolvedSession::Ready(meta) => meta,
                    _ => return Err(AppError::acp(AcpErrorCode::SessionInitFailed, "ACP metadata is missing")),
                };
                let merged = meta.runtime_options.merged_with(&patch);
                let cwd_changed = patch.cwd.is_some();

                self.metadata_store
                    .upsert(&key, |current| {
                        current.map(|c| {
                            let mut next = c.clone();
                            next.runtime_options = merged.clone();
                            if let Some(cwd) = &patch.cwd {
                                next.cwd = Some(cwd.clone());
                            }
                            next
                        })
                    })
                    .await?;

                if cwd_changed {
                    if let Some(existing) = self.handle_cache.peek(&key).await {
                        let _ = existing.runtime.close(&existing.to_backend_ref(), "cwd-changed").await;
                    }
                    self.handle_cache.clear(&key).await;
                } else if let Some(existing) = self.handle_cache.peek(&key).await {
                    let mut updated = existing;
                    updated.applied_control_signature = None;
                    self.handle_cache.set(&key, updated).await;
                }
                Ok(())
            })
            .await
    }

    /// §4.5 `resetSessionRuntimeOptions`: close the handle with
    /// `reason="reset-runtime-options"` and clear persisted options.
    ///
    /// # Errors
    ///
    /// Propagates `closeSession` and persistence failures.
    pub async fn reset_session_runtime_options(&self, cfg: &AcpConfig, session_key: &str) -> Result<()> {
        self.close_session(cfg, session_key, "reset-runtime-options", false, true, false).await?;

        let key = session_key.to_owned();
        self.actor_queue
            .run(&key, || async {
                self.metadata_store
                    .upsert(&key, |current| {
                        current.map(|c| {
                            let mut next = c.clone();
                            next.runtime_options = RuntimeOptions::default();
                            next
                        })
                    })
                    .await?;
                Ok(())
            })
            .await
    }

    /// §4.5 `runTurn`, steps 1-10.
    ///
    /// `on_event` is invoked for every event in source order, including
    /// the terminating `Error`/`Done` event, before the turn resolves.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` with the code from §7 matching the turn's
    /// failure: `SessionInitFailed` for a missing/stale session or
    /// admission rejection, `TurnFailed`/other normalized codes for an
    /// in-band runtime error.
    #[instrument(skip(self, cfg, on_event, caller_cancel), fields(session_key = %session_key))]
    pub async fn run_turn(
        &self,
        cfg: &AcpConfig,
        session_key: &str,
        text: &str,
        turn_mode: TurnMode,
        request_id: &str,
        caller_cancel: Option<CancellationToken>,
        on_event: &mut dyn FnMut(&RuntimeEvent),
    ) -> Result<()> {
        self.evict_idle_runtime_handles(cfg).await;
        let key = session_key.to_owned();
        let text = text.to_owned();
        let request_id = request_id.to_owned();

        self.actor_queue
            .run(&key, || async {
                let meta = match self.resolve_session_inner(&key).await? {
                    ResolvedSession::Ready(meta) => meta,
                    ResolvedSession::Stale => {
                        return Err(AppError::acp(AcpErrorCode::SessionInitFailed, "ACP metadata is missing"));
                    }
                    ResolvedSession::None => {
                        return Err(AppError::acp(AcpErrorCode::SessionInitFailed, "session has no ACP metadata"));
                    }
                };

                let mut handle = self.ensure_handle_for(cfg, &key, &meta).await?;

                // Step 4: reapply runtime controls iff the signature changed.
                let desired_signature = meta.runtime_options.signature();
                if handle.applied_control_signature.as_deref() != Some(desired_signature.as_str()) {
                    let caps = handle.runtime.get_capabilities(&handle.to_backend_ref()).await.unwrap_or_default();
                    if let Some(mode) = &meta.runtime_options.runtime_mode {
                        if caps.supports("setMode") {
                            handle.runtime.set_mode(&handle.to_backend_ref(), mode).await?;
                        }
                    }
                    for (option_key, value) in config_entries(&meta.runtime_options) {
                        if !caps.supports("setConfigOption") || !caps.accepts_config_key(&option_key) {
                            return Err(AppError::acp(
                                AcpErrorCode::UnsupportedControl,
                                format!("backend does not accept config option '{option_key}'"),
                            ));
                        }
                        handle.runtime.set_config_option(&handle.to_backend_ref(), &option_key, &value).await?;
                    }
                    handle.applied_control_signature = Some(desired_signature);
                    self.handle_cache.set(&key, handle.clone()).await;
                }

                // Step 5: transition to running.
                self.metadata_store
                    .upsert(&key, |current| {
                        current.map(|c| {
                            let mut next = c.clone();
                            next.state = SessionState::Running;
                            next.last_error = None;
                            next.last_activity_at = Utc::now();
                            next
                        })
                    })
                    .await?;

                // Step 6: combined cancellation.
                let internal = CancellationToken::new();
                if let Some(caller) = caller_cancel {
                    let watched = internal.clone();
                    tokio::spawn(async move {
                        caller.cancelled().await;
                        watched.cancel();
                    });
                }
                {
                    let mut active = self.active_turns.lock().await;
                    active.insert(key.clone(), internal.clone());
                }

                // Step 7: drive the event stream.
                let start = std::time::Instant::now();
                let turn_result = handle
                    .runtime
                    .run_turn(RunTurnRequest {
                        handle: handle.to_backend_ref(),
                        text,
                        turn_mode,
                        request_id,
                        cancel: internal,
                    })
                    .await;

                let outcome = match turn_result {
                    Err(err) => Err(err),
                    Ok(mut stream) => {
                        let mut deferred: Option<(AcpErrorCode, String)> = None;
                        while let Some(event) = stream.recv().await {
                            on_event(&event);
                            if let RuntimeEvent::Error { code, message } = &event {
                                deferred = Some((normalize_error_code(code), message.clone()));
                            }
                        }
                        match deferred {
                            Some((code, message)) => Err(AppError::acp(code, message)),
                            None => Ok(()),
                        }
                    }
                };

                let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                // Steps 8-9: transition on outcome, record metrics.
                let result = match &outcome {
                    Ok(()) => {
                        let _ = self
                            .metadata_store
                            .upsert(&key, |current| {
                                current.map(|c| {
                                    let mut next = c.clone();
                                    next.state = SessionState::Idle;
                                    next.last_activity_at = Utc::now();
                                    next
                                })
                            })
                            .await;
                        let mut metrics = self.metrics.lock().await;
                        metrics.record_turn(elapsed_ms, true);
                        Ok(())
                    }
                    Err(err) => {
                        let message = err.to_string();
                        let _ = self
                            .metadata_store
                            .upsert(&key, |current| {
                                current.map(|c| {
                                    let mut next = c.clone();
                                    next.state = SessionState::Error;
                                    next.last_error = Some(message.clone());
                                    next.last_activity_at = Utc::now();
                                    next
                                })
                            })
                            .await;
                        let mut metrics = self.metrics.lock().await;
                        let code = err.acp_code().unwrap_or(AcpErrorCode::TurnFailed);
                        metrics.record_turn(elapsed_ms, false);
                        *metrics.errors_by_code.entry(code).or_insert(0) += 1;
                        outcome
                    }
                };

                // Step 10 (finally): drop the active-turn entry and
                // reconcile/close depending on session mode.
                {
                    let mut active = self.active_turns.lock().await;
                    active.remove(&key);
                }
                {
                    let mut memo = self.cancel_memo.lock().await;
                    memo.remove(&key);
                }

                if meta.mode == SessionMode::Persistent {
                    if let Ok(Some(status)) = handle.runtime.get_status(&handle.to_backend_ref()).await {
                        let incoming = identity::from_status(
                            status.backend_session_id,
                            status.agent_session_id,
                            status.acpx_record_id,
                        );
                        let _ = self
                            .metadata_store
                            .upsert(&key, |current| {
                                current.map(|c| {
                                    let mut next = c.clone();
                                    next.identity = Some(identity::reconcile(next.identity.as_ref(), &incoming));
                                    next
                                })
                            })
                            .await;
                    }
                } else {
                    let _ = handle.runtime.close(&handle.to_backend_ref(), "oneshot-turn-complete").await;
                    self.handle_cache.clear(&key).await;
                }

                result
            })
            .await
    }

    /// §4.5 `cancelSession`. If a turn is active, aborts its internal
    /// cancellation token and invokes `runtime.cancel` at most once
    /// (memoized per session key); otherwise acquires the session actor
    /// directly and cancels the idle handle.
    ///
    /// # Errors
    ///
    /// Returns the backend's cancel error when there is no active turn
    /// and the direct cancel fails.
    pub async fn cancel_session(&self, session_key: &str, reason: &str) -> Result<()> {
        let active_token = {
            let active = self.active_turns.lock().await;
            active.get(session_key).cloned()
        };

        if let Some(token) = active_token {
            token.cancel();
            let should_call = {
                let mut memo = self.cancel_memo.lock().await;
                memo.insert(session_key.to_owned())
            };
            if should_call {
                if let Some(handle) = self.handle_cache.peek(session_key).await {
                    let _ = handle.runtime.cancel(&handle.to_backend_ref(), reason).await;
                }
            }
            return Ok(());
        }

        let key = session_key.to_owned();
        let reason = reason.to_owned();
        self.actor_queue
            .run(&key, || async {
                let Some(handle) = self.handle_cache.peek(&key).await else {
                    return Ok(());
                };
                match handle.runtime.cancel(&handle.to_backend_ref(), &reason).await {
                    Ok(()) => {
                        self.metadata_store
                            .upsert(&key, |current| {
                                current.map(|c| {
                                    let mut next = c.clone();
                                    next.state = SessionState::Idle;
                                    next
                                })
                            })
                            .await?;
                        Ok(())
                    }
                    Err(err) => {
                        let message = err.to_string();
                        let _ = self
                            .metadata_store
                            .upsert(&key, |current| {
                                current.map(|c| {
                                    let mut next = c.clone();
                                    next.state = SessionState::Error;
                                    next.last_error = Some(message.clone());
                                    next
                                })
                            })
                            .await;
                        Err(err)
                    }
                }
            })
            .await
    }

    /// §4.5 `closeSession`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp(SessionInitFailed)` if `requireAcpSession`
    /// is set and no ACP session exists, or the backend's close error
    /// unless it is `BackendMissing`/`BackendUnavailable` and
    /// `allowBackendUnavailable` is set (in which case the cache slot is
    /// dropped and a notice string is returned instead).
    #[instrument(skip(self, cfg))]
    pub async fn close_session(
        &self,
        cfg: &AcpConfig,
        session_key: &str,
        reason: &str,
        clear_meta: bool,
        allow_backend_unavailable: bool,
        require_acp_session: bool,
    ) -> Result<Option<String>> {
        self.evict_idle_runtime_handles(cfg).await;
        let key = session_key.to_owned();
        let reason = reason.to_owned();

        self.actor_queue
            .run(&key, || async {
                let meta = match self.resolve_session_inner(&key).await? {
                    ResolvedSession::Ready(meta) => meta,
                    ResolvedSession::None | ResolvedSession::Stale => {
                        if require_acp_session {
                            return Err(AppError::acp(AcpErrorCode::SessionInitFailed, "no ACP session to close"));
                        }
                        return Ok(None);
                    }
                };

                let handle = match self.handle_cache.peek(&key).await {
                    Some(handle) => handle,
                    None => {
                        let runtime = self.registry.resolve(&meta.backend)?;
                        let cwd = meta.cwd.clone().or_else(|| meta.runtime_options.cwd.clone());
                        let ensure_result = runtime
                            .ensure_session(EnsureSessionRequest {
                                session_key: key.clone(),
                                agent: meta.agent.clone(),
                                mode: meta.mode,
                                cwd: cwd.clone(),
                            })
                            .await?;
                        RuntimeHandle {
                            runtime,
                            session_key: key.clone(),
                            backend: meta.backend.clone(),
                            agent: meta.agent.clone(),
                            mode: meta.mode,
                            cwd,
                            runtime_session_name: ensure_result.runtime_session_name,
                            backend_session_id: ensure_result.backend_session_id,
                            agent_session_id: ensure_result.agent_session_id,
                            last_touched_at: Utc::now(),
                            applied_control_signature: None,
                        }
                    }
                };

                let notice = match handle.runtime.close(&handle.to_backend_ref(), &reason).await {
                    Ok(()) => {
                        self.handle_cache.clear(&key).await;
                        None
                    }
                    Err(err) => {
                        let code = err.acp_code();
                        let unavailable =
                            matches!(code, Some(AcpErrorCode::BackendMissing) | Some(AcpErrorCode::BackendUnavailable));
                        if allow_backend_unavailable && unavailable {
                            self.handle_cache.clear(&key).await;
                            Some(err.to_string())
                        } else {
                            return Err(err);
                        }
                    }
                };

                if clear_meta {
                    self.metadata_store.upsert(&key, |_| None).await?;
                }
                Ok(notice)
            })
            .await
    }

    /// §4.5 `reconcilePendingSessionIdentities`: enumerate every
    /// `identity.state = pending` session and attempt to corroborate it
    /// via `getStatus`. Per-session failures are swallowed and counted,
    /// never propagated.
    pub async fn reconcile_pending_session_identities(&self, cfg: &AcpConfig) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let Ok(all) = self.metadata_store.list().await else {
            return report;
        };

        for (key, meta) in all {
            let is_pending = meta
                .identity
                .as_ref()
                .is_some_and(|identity| identity.state == IdentityState::Pending);
            if !is_pending {
                continue;
            }
            report.checked += 1;

            let key_owned = key.clone();
            let meta_for_closure = meta.clone();
            let result: Result<bool> = self
                .actor_queue
                .run(&key_owned, || async {
                    let handle = self.ensure_handle_for(cfg, &key_owned, &meta_for_closure).await?;
                    let Some(status) = handle.runtime.get_status(&handle.to_backend_ref()).await? else {
                        return Ok(false);
                    };
                    let incoming = identity::from_status(
                        status.backend_session_id,
                        status.agent_session_id,
                        status.acpx_record_id,
                    );
                    let resolved_now = incoming.state == IdentityState::Resolved && !incoming.is_empty();
                    self.metadata_store
                        .upsert(&key_owned, |current| {
                            current.map(|c| {
                                let mut next = c.clone();
                                next.identity = Some(identity::reconcile(next.identity.as_ref(), &incoming));
                                next
                            })
                        })
                        .await?;
                    Ok(resolved_now)
                })
                .await;

            match result {
                Ok(true) => report.resolved += 1,
                Ok(false) => {}
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// §4.5 `getObservabilitySnapshot`.
    pub async fn get_observability_snapshot(&self, cfg: &AcpConfig) -> ObservabilitySnapshot {
        let active_sessions = self.handle_cache.size().await;
        let active_turns = self.active_turns.lock().await.len();
        let queue_depth = self.actor_queue.total_pending().await;
        let metrics = self.metrics.lock().await;

        ObservabilitySnapshot {
            runtime_cache: RuntimeCacheSnapshot {
                active_sessions,
                idle_ttl_ms: (cfg.runtime.ttl_minutes * 60_000.0) as i64,
                evicted_total: metrics.evicted_total,
                last_evicted_at: metrics.last_evicted_at,
            },
            turns: TurnsSnapshot {
                active: active_turns,
                queue_depth,
                completed: metrics.turns_completed,
                failed: metrics.turns_failed,
                average_latency_ms: metrics.average_latency_ms(),
                max_latency_ms: metrics.max_latency_ms,
            },
            errors_by_code: metrics.errors_by_code.iter().map(|(k, v)| (k.as_str().to_owned(), *v)).collect(),
        }
    }
}

/// The `(key, value)` config-option entries a persisted `RuntimeOptions`
/// implies, excluding `runtimeMode` (applied via `setMode`) and `cwd`
/// (not a backend config option — it governs handle identity instead).
fn config_entries(opts: &RuntimeOptions) -> Vec<(String, Value)> {
    let mut entries = Vec::new();
    if let Some(model) = &opts.model {
        entries.push(("model".to_owned(), Value::String(model.clone())));
    }
    if let Some(profile) = &opts.permission_profile {
        entries.push(("permissionProfile".to_owned(), Value::String(profile.clone())));
    }
    if let Some(timeout) = opts.timeout_seconds {
        entries.push(("timeoutSeconds".to_owned(), Value::from(timeout)));
    }
    entries
}
