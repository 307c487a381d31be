//! ACP Runtime Backend contract (§4.4) and the registry that resolves a
//! named backend id to an implementation (§4.5, "ACP Runtime Backend
//! Registry").
//!
//! # Submodules
//!
//! - [`registry`]: maps a backend id to an `Arc<dyn RuntimeBackend>`.
//! - [`process_runtime`]: a concrete backend that speaks NDJSON to a
//!   spawned child process — an end-to-end runnable example of the
//!   contract (§1.2 supplemented feature), built from the same
//!   spawner/handshake/reader/writer/codec shape the teacher crate used
//!   for its own agent-process stream handling.

pub mod process_runtime;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{RuntimeCapabilities, RuntimeEvent, RuntimeStatus, SessionMode, TurnMode};
use crate::Result;

pub use registry::BackendRegistry;

/// The manager-side view of a runtime handle, passed into every backend
/// call. Distinct from [`crate::session::RuntimeHandle`] (which also owns
/// the `Arc<dyn RuntimeBackend>` itself) so backend methods never need a
/// reference back into their own trait object.
#[derive(Debug, Clone)]
pub struct BackendHandleRef {
    /// Session key this handle belongs to.
    pub session_key: String,
    /// Agent identity routed to.
    pub agent: String,
    /// Persistent vs. oneshot.
    pub mode: SessionMode,
    /// Working directory override, if any.
    pub cwd: Option<String>,
    /// Backend-local handle name.
    pub runtime_session_name: String,
    /// Backend session id, once known.
    pub backend_session_id: Option<String>,
    /// Agent session id, once known.
    pub agent_session_id: Option<String>,
}

/// Input to `ensureSession` (§4.4).
#[derive(Debug, Clone)]
pub struct EnsureSessionRequest {
    /// Session key being ensured.
    pub session_key: String,
    /// Agent identity to route to.
    pub agent: String,
    /// Persistent vs. oneshot.
    pub mode: SessionMode,
    /// Working directory override, if any.
    pub cwd: Option<String>,
}

/// Output of `ensureSession`: may include preliminary identifiers the
/// manager seeds a `pending` identity from.
#[derive(Debug, Clone, Default)]
pub struct EnsureSessionResult {
    /// Backend-local handle name assigned to this session.
    pub runtime_session_name: String,
    /// Preliminary backend session id, if the backend assigns one eagerly.
    pub backend_session_id: Option<String>,
    /// Preliminary agent session id, if the backend assigns one eagerly.
    pub agent_session_id: Option<String>,
}

/// Input to `runTurn` (§4.4).
pub struct RunTurnRequest {
    /// The handle to run the turn against.
    pub handle: BackendHandleRef,
    /// User (or steering) text.
    pub text: String,
    /// Prompt vs. steer.
    pub turn_mode: TurnMode,
    /// Caller-supplied idempotency/tracing id.
    pub request_id: String,
    /// Cancellation signal combining the caller's signal with the
    /// manager's internal per-session controller (§4.5, §5).
    pub cancel: CancellationToken,
}

/// A live event stream from a `runTurn` call. The backend is the
/// producer; closing the channel (dropping the sender) signals
/// completion. The manager drains remaining events after an in-band
/// `Error` event before raising, per backend-ordering requirements (§9).
pub type RuntimeEventStream = mpsc::Receiver<RuntimeEvent>;

/// A pluggable AI runtime backend implementing the ACP streaming contract.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Stable identifier this backend is registered under.
    fn id(&self) -> &str;

    /// Open (or adopt) a runtime-local session for `request`.
    ///
    /// # Errors
    ///
    /// Returns an `AppError::Acp` with a code from §7 on failure.
    async fn ensure_session(&self, request: EnsureSessionRequest) -> Result<EnsureSessionResult>;

    /// Start a turn and return its event stream.
    ///
    /// # Errors
    ///
    /// Returns an `AppError::Acp` with a code from §7 on failure to start.
    /// Mid-turn failures are reported as `RuntimeEvent::Error` on the
    /// returned stream, not as an `Err` here.
    async fn run_turn(&self, request: RunTurnRequest) -> Result<RuntimeEventStream>;

    /// Cancel an in-flight turn. Idempotent: the manager memoizes so this
    /// is called at most once per turn, but implementations should still
    /// tolerate repeat calls gracefully.
    ///
    /// # Errors
    ///
    /// Returns an `AppError::Acp` with a code from §7 on failure.
    async fn cancel(&self, handle: &BackendHandleRef, reason: &str) -> Result<()>;

    /// Close a runtime-local session.
    ///
    /// # Errors
    ///
    /// Returns an `AppError::Acp` with a code from §7 on failure. Callers
    /// treat `ACP_BACKEND_MISSING` / `ACP_BACKEND_UNAVAILABLE` specially
    /// when `allowBackendUnavailable` is set.
    async fn close(&self, handle: &BackendHandleRef, reason: &str) -> Result<()>;

    /// Optional: advertised control capabilities.
    ///
    /// # Errors
    ///
    /// Returns an `AppError::Acp` with a code from §7 on failure. The
    /// default implementation returns an empty capability set (no
    /// controls supported).
    async fn get_capabilities(&self, _handle: &BackendHandleRef) -> Result<RuntimeCapabilities> {
        Ok(RuntimeCapabilities::default())
    }

    /// Optional: a status snapshot used for identity reconciliation and
    /// `getSessionStatus`.
    ///
    /// # Errors
    ///
    /// Returns an `AppError::Acp` with a code from §7 on failure. The
    /// default implementation reports "unsupported" as `None`.
    async fn get_status(&self, _handle: &BackendHandleRef) -> Result<Option<RuntimeStatus>> {
        Ok(None)
    }

    /// Optional: switch the backend-local runtime mode.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` with code `UnsupportedControl` unless
    /// overridden.
    async fn set_mode(&self, _handle: &BackendHandleRef, _mode: &str) -> Result<()> {
        Err(crate::AppError::acp(
            crate::errors::AcpErrorCode::UnsupportedControl,
            "backend does not support setMode",
        ))
    }

    /// Optional: set a single named config option.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` with code `UnsupportedControl` unless
    /// overridden.
    async fn set_config_option(&self, _handle: &BackendHandleRef, _key: &str, _value: &Value) -> Result<()> {
        Err(crate::AppError::acp(
            crate::errors::AcpErrorCode::UnsupportedControl,
            "backend does not support setConfigOption",
        ))
    }
}
