//! Shared test helpers: a scriptable [`RuntimeBackend`] fake plus small
//! constructors for the config/manager scaffolding every scenario test
//! needs, so individual test modules can focus on behavior.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use openclaw_core::acp::registry::BackendRegistry;
use openclaw_core::acp::{BackendHandleRef, EnsureSessionRequest, EnsureSessionResult, RunTurnRequest, RuntimeBackend, RuntimeEventStream};
use openclaw_core::config::{AcpConfig, GlobalConfig};
use openclaw_core::errors::AcpErrorCode;
use openclaw_core::model::{RuntimeCapabilities, RuntimeEvent, RuntimeStatus};
use openclaw_core::persistence::db;
use openclaw_core::persistence::metadata_store::SessionMetadataStore;
use openclaw_core::session::manager::AcpSessionManager;
use openclaw_core::{AppError, Result};
use tokio::sync::Mutex;

/// A [`RuntimeBackend`] fake whose every observable behavior is scripted
/// by the test: `ensureSession` results/failures, `runTurn` event
/// sequences (one queued script consumed per call), advertised
/// capabilities, `getStatus` snapshots, and call counts for every method.
pub struct ScriptableBackend {
    id: String,
    ensure_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    close_calls: AtomicUsize,
    ensure_error: Mutex<Option<AcpErrorCode>>,
    capabilities: Mutex<RuntimeCapabilities>,
    status: Mutex<Option<RuntimeStatus>>,
    scripts: Mutex<VecDeque<Vec<RuntimeEvent>>>,
    close_error: Mutex<Option<AcpErrorCode>>,
    applied_modes: Mutex<Vec<String>>,
    applied_options: Mutex<Vec<(String, serde_json::Value)>>,
    /// When set, `run_turn` waits for the caller's cancellation token
    /// instead of immediately draining its script, then emits a single
    /// `Error` event — used to exercise the cancel-mid-turn path (S5).
    wait_for_cancel: Mutex<bool>,
}

impl ScriptableBackend {
    /// A fresh backend registered under `id`, with no scripted turns, no
    /// advertised capabilities, and no status support.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ensure_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            ensure_error: Mutex::new(None),
            capabilities: Mutex::new(RuntimeCapabilities::default()),
            status: Mutex::new(None),
            scripts: Mutex::new(VecDeque::new()),
            close_error: Mutex::new(None),
            applied_modes: Mutex::new(Vec::new()),
            applied_options: Mutex::new(Vec::new()),
            wait_for_cancel: Mutex::new(false),
        }
    }

    /// Queue one event sequence; each `run_turn` call consumes the
    /// oldest queued script, falling back to a bare `Done` if exhausted.
    pub async fn push_script(&self, events: Vec<RuntimeEvent>) {
        self.scripts.lock().await.push_back(events);
    }

    /// Make every subsequent `ensure_session` call fail with `code`.
    pub async fn fail_ensure_with(&self, code: AcpErrorCode) {
        *self.ensure_error.lock().await = Some(code);
    }

    /// Make every subsequent `close` call fail with `code`.
    pub async fn fail_close_with(&self, code: AcpErrorCode) {
        *self.close_error.lock().await = Some(code);
    }

    pub async fn set_capabilities(&self, caps: RuntimeCapabilities) {
        *self.capabilities.lock().await = caps;
    }

    pub async fn set_status(&self, status: RuntimeStatus) {
        *self.status.lock().await = Some(status);
    }

    pub async fn set_wait_for_cancel(&self, wait: bool) {
        *self.wait_for_cancel.lock().await = wait;
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub async fn applied_modes(&self) -> Vec<String> {
        self.applied_modes.lock().await.clone()
    }

    pub async fn applied_options(&self) -> Vec<(String, serde_json::Value)> {
        self.applied_options.lock().await.clone()
    }
}

#[async_trait]
impl RuntimeBackend for ScriptableBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_session(&self, request: EnsureSessionRequest) -> Result<EnsureSessionResult> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = *self.ensure_error.lock().await {
            return Err(AppError::acp(code, "scripted ensure failure"));
        }
        Ok(EnsureSessionResult {
            runtime_session_name: format!("rt-{}", request.session_key),
            backend_session_id: Some(format!("backend-{}", request.session_key)),
            agent_session_id: None,
        })
    }

    async fn run_turn(&self, request: RunTurnRequest) -> Result<RuntimeEventStream> {
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        let script = self.scripts.lock().await.pop_front().unwrap_or_else(|| vec![RuntimeEvent::Done { stop_reason: None }]);
        let wait_for_cancel = *self.wait_for_cancel.lock().await;

        tokio::spawn(async move {
            if wait_for_cancel {
                request.cancel.cancelled().await;
                let _ = tx
                    .send(RuntimeEvent::Error {
                        code: "cancelled".to_owned(),
                        message: "turn cancelled".to_owned(),
                    })
                    .await;
                return;
            }
            for event in script {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn cancel(&self, _handle: &BackendHandleRef, _reason: &str) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _handle: &BackendHandleRef, _reason: &str) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = *self.close_error.lock().await {
            return Err(AppError::acp(code, "scripted close failure"));
        }
        Ok(())
    }

    async fn get_capabilities(&self, _handle: &BackendHandleRef) -> Result<RuntimeCapabilities> {
        Ok(self.capabilities.lock().await.clone())
    }

    async fn get_status(&self, _handle: &BackendHandleRef) -> Result<Option<RuntimeStatus>> {
        Ok(self.status.lock().await.clone())
    }

    async fn set_mode(&self, _handle: &BackendHandleRef, mode: &str) -> Result<()> {
        self.applied_modes.lock().await.push(mode.to_owned());
        Ok(())
    }

    async fn set_config_option(&self, _handle: &BackendHandleRef, key: &str, value: &serde_json::Value) -> Result<()> {
        self.applied_options.lock().await.push((key.to_owned(), value.clone()));
        Ok(())
    }
}

/// Build an `AcpSessionManager` backed by an in-memory `SQLite` store and
/// a single `ScriptableBackend` registered under `"test-backend"`.
pub async fn manager_with_backend() -> (AcpSessionManager, Arc<ScriptableBackend>) {
    let db = db::connect_memory().await.expect("in-memory db");
    let metadata_store = SessionMetadataStore::new(db);
    let backend = Arc::new(ScriptableBackend::new("test-backend"));

    let mut registry = BackendRegistry::new();
    registry.register(Arc::clone(&backend) as Arc<dyn RuntimeBackend>);

    (AcpSessionManager::new(metadata_store, registry), backend)
}

/// A default `AcpConfig` with `backend = "test-backend"` and a small
/// `maxConcurrentSessions` so admission-control tests don't need to open
/// dozens of handles.
#[must_use]
pub fn test_acp_config(max_concurrent_sessions: u32) -> AcpConfig {
    AcpConfig {
        backend: "test-backend".to_owned(),
        max_concurrent_sessions,
        ..AcpConfig::default()
    }
}

/// A minimal valid `GlobalConfig`, workspace root pinned to a fixed
/// absolute path so `validate()` passes without touching the filesystem.
#[must_use]
pub fn test_global_config() -> GlobalConfig {
    GlobalConfig {
        workspace_root: std::path::PathBuf::from("/tmp/openclaw-test-workspace"),
        acp: test_acp_config(8),
        channels: HashMap::new(),
        ..GlobalConfig::default()
    }
}
