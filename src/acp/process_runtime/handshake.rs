//! LSP-style `initialize` / `initialized` exchange performed before the
//! reader/writer tasks start talking turns.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};

use crate::errors::AcpErrorCode;
use crate::{AppError, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Send `initialize` and wait for the matching `initialized` reply.
///
/// # Errors
///
/// Returns `AppError::Acp` with code `SessionInitFailed` if the write
/// fails, the handshake times out, or the agent exits before replying.
pub async fn perform(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    session_key: &str,
) -> Result<()> {
    let msg = json!({ "type": "initialize", "sessionKey": session_key }).to_string();
    stdin
        .write_all(format!("{msg}\n").as_bytes())
        .await
        .map_err(|e| AppError::acp(AcpErrorCode::SessionInitFailed, format!("handshake write failed: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| AppError::acp(AcpErrorCode::SessionInitFailed, format!("handshake flush failed: {e}")))?;

    let mut line = String::new();
    let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, stdout.read_line(&mut line)).await;

    match read {
        Ok(Ok(0)) => Err(AppError::acp(
            AcpErrorCode::SessionInitFailed,
            "agent exited during handshake",
        )),
        Ok(Ok(_)) => {
            let value: serde_json::Value = serde_json::from_str(line.trim()).map_err(|e| {
                AppError::acp(AcpErrorCode::SessionInitFailed, format!("handshake malformed json: {e}"))
            })?;
            if value.get("type").and_then(serde_json::Value::as_str) == Some("initialized") {
                Ok(())
            } else {
                Err(AppError::acp(
                    AcpErrorCode::SessionInitFailed,
                    format!("handshake expected 'initialized', got: {line}"),
                ))
            }
        }
        Ok(Err(e)) => Err(AppError::acp(AcpErrorCode::SessionInitFailed, format!("handshake io error: {e}"))),
        Err(_) => Err(AppError::acp(AcpErrorCode::SessionInitFailed, "handshake timeout")),
    }
}
