//! Outbound NDJSON writer for the process-backed runtime.

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;

use crate::errors::AcpErrorCode;
use crate::{AppError, Result};

/// Serialize `value` as a single NDJSON line and write it to `stdin`.
///
/// # Errors
///
/// Returns `AppError::Acp` with code `TurnFailed` on write failure.
pub async fn send_line(stdin: &mut ChildStdin, value: &Value) -> Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| AppError::acp(AcpErrorCode::TurnFailed, format!("failed to write to agent stdin: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| AppError::acp(AcpErrorCode::TurnFailed, format!("failed to flush agent stdin: {e}")))
}
