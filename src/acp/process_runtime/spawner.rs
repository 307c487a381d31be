//! Process spawner for the process-backed ACP runtime.
//!
//! Spawns a headless agent process with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `env_clear()` + a safe variable allowlist so host secrets never leak
//!   into the child's environment.
//! - A configurable startup timeout: if the agent does not emit its ready
//!   signal (first stdout line) within the window, the process is killed
//!   and an `ACP_SESSION_INIT_FAILED` error is returned.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::errors::AcpErrorCode;
use crate::{AppError, Result};

/// Environment variables inherited by the spawned agent process. Every
/// other variable from the host environment is stripped via
/// `env_clear()` before the child is launched.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Configuration for spawning a process-backed ACP agent.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Host CLI binary (e.g. `claude`, a local agent harness).
    pub host_cli: String,
    /// Default arguments passed to the host CLI.
    pub host_cli_args: Vec<String>,
    /// Working directory the child process starts in.
    pub cwd: PathBuf,
    /// Maximum time to wait for the agent's ready signal.
    pub startup_timeout: Duration,
}

/// Active stdio connection to a spawned agent process.
#[derive(Debug)]
pub struct ProcessConnection {
    /// Session key the process was launched for.
    pub session_key: String,
    /// Child process handle — kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Agent's stdin for sending JSON messages.
    pub stdin: ChildStdin,
    /// Buffered reader over the agent's stdout.
    pub stdout: BufReader<ChildStdout>,
}

/// Spawn an agent process and wait for its ready signal (first stdout line).
///
/// # Errors
///
/// Returns `AppError::Acp` with code `SessionInitFailed` on spawn failure,
/// startup timeout, or early EOF.
pub async fn spawn_agent(config: &SpawnConfig, session_key: &str) -> Result<ProcessConnection> {
    let mut cmd = Command::new(&config.host_cli);
    for arg in &config.host_cli_args {
        cmd.arg(arg);
    }

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.env("OPENCLAW_SESSION_KEY", session_key);

    cmd.current_dir(&config.cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::acp(AcpErrorCode::SessionInitFailed, format!("failed to spawn agent: {err}"))
    })?;

    let stdin = child.stdin.take().ok_or_else(|| {
        AppError::acp(AcpErrorCode::SessionInitFailed, "failed to capture agent stdin")
    })?;
    let stdout_raw = child.stdout.take().ok_or_else(|| {
        AppError::acp(AcpErrorCode::SessionInitFailed, "failed to capture agent stdout")
    })?;

    let mut reader = BufReader::new(stdout_raw);
    let mut line = String::new();

    match tokio::time::timeout(config.startup_timeout, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => {
            info!(session_key, ready_line = line.trim(), "agent emitted ready signal");
        }
        Ok(Ok(_)) => {
            return Err(AppError::acp(
                AcpErrorCode::SessionInitFailed,
                "agent process exited before ready signal",
            ));
        }
        Ok(Err(err)) => {
            return Err(AppError::acp(
                AcpErrorCode::SessionInitFailed,
                format!("failed to read agent ready signal: {err}"),
            ));
        }
        Err(_elapsed) => {
            child.kill().await.ok();
            return Err(AppError::acp(
                AcpErrorCode::SessionInitFailed,
                format!(
                    "startup timeout: agent did not emit ready signal within {:?}",
                    config.startup_timeout
                ),
            ));
        }
    }

    Ok(ProcessConnection {
        session_key: session_key.to_owned(),
        child,
        stdin,
        stdout: reader,
    })
}
