//! A concrete ACP runtime backend that speaks NDJSON to a spawned child
//! process (§1.2 supplemented feature). Gives the crate an end-to-end
//! runnable example of the §4.4 contract without requiring a real external
//! agent binary — any program that reads/writes the small NDJSON protocol
//! documented in this module's submodules works as a backend.
//!
//! # Submodules
//!
//! - [`codec`]: NDJSON framing with a 1 MiB per-line limit.
//! - [`handshake`]: `initialize` / `initialized` exchange before any turn.
//! - [`reader`]: background demultiplexer from stdout to turn events /
//!   control-RPC completions.
//! - [`writer`]: outbound NDJSON line writer.
//! - [`spawner`]: process spawning with environment isolation and a
//!   startup-timeout ready-signal wait.

pub mod codec;
pub mod handshake;
pub mod reader;
pub mod spawner;
pub mod writer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AcpErrorCode;
use crate::model::{RuntimeCapabilities, RuntimeStatus, SessionMode};
use crate::{AppError, Result};

use super::{BackendHandleRef, EnsureSessionRequest, EnsureSessionResult, RunTurnRequest, RuntimeBackend, RuntimeEventStream};
use reader::{CurrentTurnSlot, PendingControlTable};
use spawner::SpawnConfig;

struct ProcessSession {
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<ChildStdin>>,
    current_turn: CurrentTurnSlot,
    pending_control: PendingControlTable,
}

/// Process-backed [`RuntimeBackend`] implementation.
pub struct ProcessRuntimeBackend {
    id: String,
    host_cli: String,
    host_cli_args: Vec<String>,
    default_cwd: PathBuf,
    startup_timeout: Duration,
    control_timeout: Duration,
    sessions: Mutex<HashMap<String, ProcessSession>>,
}

impl ProcessRuntimeBackend {
    /// Construct a new backend registered under `id`, launching
    /// `host_cli host_cli_args...` per session.
    #[must_use]
    pub fn new(id: impl Into<String>, host_cli: impl Into<String>, host_cli_args: Vec<String>, default_cwd: PathBuf) -> Self {
        Self {
            id: id.into(),
            host_cli: host_cli.into(),
            host_cli_args,
            default_cwd,
            startup_timeout: Duration::from_secs(15),
            control_timeout: Duration::from_secs(10),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn send_control(
        &self,
        session_key: &str,
        mut payload: Value,
    ) -> Result<Value> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_key).ok_or_else(|| {
            AppError::acp(AcpErrorCode::BackendUnavailable, format!("no process session for {session_key}"))
        })?;

        let request_id = Uuid::new_v4().to_string();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("requestId".to_owned(), Value::String(request_id.clone()));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = session.pending_control.lock().await;
            pending.insert(request_id.clone(), tx);
        }

        {
            let mut stdin = session.stdin.lock().await;
            writer::send_line(&mut stdin, &payload).await?;
        }

        match tokio::time::timeout(self.control_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(AppError::acp(AcpErrorCode::TurnFailed, "control channel closed before reply")),
            Err(_) => {
                let mut pending = session.pending_control.lock().await;
                pending.remove(&request_id);
                Err(AppError::acp(AcpErrorCode::TurnFailed, "control request timed out"))
            }
        }
    }

    /// Best-effort direct process signal, independent of the NDJSON
    /// control channel: a child wedged and no longer reading stdin would
    /// never observe a `turn/cancel` line, so on Unix it is additionally
    /// sent `SIGINT` by pid. Never fails the caller — this is a secondary
    /// mechanism alongside `send_control`, not a replacement.
    async fn signal_child_directly(&self, session_key: &str) {
        #[cfg(unix)]
        {
            let sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(session_key) else { return };
            let child = session.child.lock().await;
            let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else { return };
            if let Err(err) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGINT) {
                warn!(session_key = %session_key, %err, "failed to deliver SIGINT directly to agent host process");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = session_key;
        }
    }
}

#[async_trait]
impl RuntimeBackend for ProcessRuntimeBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_session(&self, request: EnsureSessionRequest) -> Result<EnsureSessionResult> {
        {
            let sessions = self.sessions.lock().await;
            if sessions.contains_key(&request.session_key) {
                return Ok(EnsureSessionResult {
                    runtime_session_name: request.session_key.clone(),
                    backend_session_id: None,
                    agent_session_id: None,
                });
            }
        }

        let cwd = request
            .cwd
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_cwd.clone());

        let config = SpawnConfig {
            host_cli: self.host_cli.clone(),
            host_cli_args: self.host_cli_args.clone(),
            cwd,
            startup_timeout: self.startup_timeout,
        };

        let mut connection = spawner::spawn_agent(&config, &request.session_key).await?;
        handshake::perform(&mut connection.stdin, &mut connection.stdout, &request.session_key).await?;

        let current_turn: CurrentTurnSlot = Arc::new(Mutex::new(None));
        let pending_control: PendingControlTable = Arc::new(Mutex::new(HashMap::new()));
        let stdout = connection.stdout.into_inner();

        tokio::spawn(reader::run(
            request.session_key.clone(),
            stdout,
            Arc::clone(&current_turn),
            Arc::clone(&pending_control),
        ));

        let session = ProcessSession {
            child: Arc::new(Mutex::new(connection.child)),
            stdin: Arc::new(Mutex::new(connection.stdin)),
            current_turn,
            pending_control,
        };

        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(request.session_key.clone(), session);
        }

        let ack = self
            .send_control(
                &request.session_key,
                json!({
                    "type": "session/new",
                    "sessionKey": request.session_key,
                    "agent": request.agent,
                    "mode": matches!(request.mode, SessionMode::Persistent).then_some("persistent").unwrap_or("oneshot"),
                }),
            )
            .await?;

        let backend_session_id = ack.get("backendSessionId").and_then(Value::as_str).map(str::to_owned);
        let agent_session_id = ack.get("agentSessionId").and_then(Value::as_str).map(str::to_owned);

        info!(session_key = %request.session_key, "process runtime: session ensured");

        Ok(EnsureSessionResult {
            runtime_session_name: request.session_key,
            backend_session_id,
            agent_session_id,
        })
    }

    async fn run_turn(&self, request: RunTurnRequest) -> Result<RuntimeEventStream> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(&request.handle.session_key).ok_or_else(|| {
            AppError::acp(
                AcpErrorCode::BackendUnavailable,
                format!("no process session for {}", request.handle.session_key),
            )
        })?;

        let (tx, rx) = mpsc::channel(64);
        {
            let mut guard = session.current_turn.lock().await;
            *guard = Some(tx);
        }

        let mode_str = match request.turn_mode {
            crate::model::TurnMode::Prompt => "prompt",
            crate::model::TurnMode::Steer => "steer",
        };

        let payload = json!({
            "type": "turn/prompt",
            "text": request.text,
            "mode": mode_str,
        });

        {
            let mut stdin = session.stdin.lock().await;
            writer::send_line(&mut stdin, &payload).await?;
        }

        Ok(rx)
    }

    async fn cancel(&self, handle: &BackendHandleRef, reason: &str) -> Result<()> {
        self.signal_child_directly(&handle.session_key).await;
        self.send_control(
            &handle.session_key,
            json!({ "type": "turn/cancel", "reason": reason }),
        )
        .await
        .map(|_| ())
    }

    async fn close(&self, handle: &BackendHandleRef, reason: &str) -> Result<()> {
        let ack = self
            .send_control(&handle.session_key, json!({ "type": "session/close", "reason": reason }))
            .await;

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(&handle.session_key) {
            let mut child = session.child.lock().await;
            let grace = Duration::from_secs(5);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(session_key = %handle.session_key, "process did not exit within grace period, killing");
                let _ = child.kill().await;
            }
        }

        ack.map(|_| ())
    }

    async fn get_capabilities(&self, handle: &BackendHandleRef) -> Result<RuntimeCapabilities> {
        let value = self.send_control(&handle.session_key, json!({ "type": "capabilities/get" })).await?;
        let controls = value
            .get("controls")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default();
        let config_option_keys = value.get("configOptionKeys").and_then(Value::as_array).map(|arr| {
            arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect()
        });
        Ok(RuntimeCapabilities { controls, config_option_keys })
    }

    async fn get_status(&self, handle: &BackendHandleRef) -> Result<Option<RuntimeStatus>> {
        let value = self.send_control(&handle.session_key, json!({ "type": "status/get" })).await?;
        Ok(Some(RuntimeStatus {
            summary: value.get("summary").and_then(Value::as_str).unwrap_or_default().to_owned(),
            backend_session_id: value.get("backendSessionId").and_then(Value::as_str).map(str::to_owned),
            agent_session_id: value.get("agentSessionId").and_then(Value::as_str).map(str::to_owned),
            acpx_record_id: value.get("acpxRecordId").and_then(Value::as_str).map(str::to_owned),
            details: value.get("details").cloned(),
        }))
    }

    async fn set_mode(&self, handle: &BackendHandleRef, mode: &str) -> Result<()> {
        self.send_control(&handle.session_key, json!({ "type": "mode/set", "mode": mode }))
            .await
            .map(|_| ())
    }

    async fn set_config_option(&self, handle: &BackendHandleRef, key: &str, value: &Value) -> Result<()> {
        self.send_control(
            &handle.session_key,
            json!({ "type": "config/set", "key": key, "value": value }),
        )
        .await
        .map(|_| ())
    }
}
