//! Background reader task for the process-backed runtime.
//!
//! Demultiplexes a single agent stdout stream into two destinations: the
//! current turn's event channel (`turn/*` messages) and one-shot
//! completions for outstanding control RPCs (`capabilities/result`,
//! `status/result`, `ack`, ...). Only one turn is ever in flight per
//! session (enforced upstream by the session actor queue), so a single
//! "current turn sender" slot is sufficient — no per-request-id turn
//! routing is needed.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use super::codec::NdjsonCodec;
use crate::model::RuntimeEvent;

/// Shared slot for the sender half of the currently running turn's event
/// channel, if any.
pub type CurrentTurnSlot = Arc<Mutex<Option<mpsc::Sender<RuntimeEvent>>>>;

/// Shared table of outstanding control-RPC completions, keyed by request id.
pub type PendingControlTable = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

/// Drive the reader loop over `stdout` until EOF or an unrecoverable I/O
/// error. Runs for the lifetime of the process-backed session.
pub async fn run(
    session_key: String,
    stdout: ChildStdout,
    current_turn: CurrentTurnSlot,
    pending_control: PendingControlTable,
) where
    ChildStdout: AsyncRead,
{
    let mut framed = FramedRead::new(stdout, NdjsonCodec::new());

    loop {
        match framed.next().await {
            None => {
                debug!(session_key, "process runtime reader: EOF");
                finish_in_flight_turn(&current_turn, "agent process exited").await;
                break;
            }
            Some(Err(err)) => {
                warn!(session_key, %err, "process runtime reader: stream error");
                finish_in_flight_turn(&current_turn, &err.to_string()).await;
                break;
            }
            Some(Ok(line)) => {
                dispatch_line(&session_key, &line, &current_turn, &pending_control).await;
            }
        }
    }
}

async fn dispatch_line(
    session_key: &str,
    line: &str,
    current_turn: &CurrentTurnSlot,
    pending_control: &PendingControlTable,
) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(err) => {
            warn!(session_key, %err, raw_line = line, "process runtime reader: malformed json, skipping");
            return;
        }
    };

    let msg_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
    let request_id = value.get("requestId").and_then(Value::as_str).map(str::to_owned);

    match msg_type {
        "turn/text_delta" => {
            let text = value.get("text").and_then(Value::as_str).unwrap_or_default().to_owned();
            send_turn_event(current_turn, RuntimeEvent::TextDelta { text }).await;
        }
        "turn/tool_result" => {
            let tool = value.get("tool").and_then(Value::as_str).unwrap_or_default().to_owned();
            let output = value.get("output").and_then(Value::as_str).unwrap_or_default().to_owned();
            let media_urls = value
                .get("mediaUrls")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
                .unwrap_or_default();
            send_turn_event(current_turn, RuntimeEvent::ToolResult { tool, output, media_urls }).await;
        }
        "turn/error" => {
            let code = value.get("code").and_then(Value::as_str).unwrap_or("unknown").to_owned();
            let message = value.get("message").and_then(Value::as_str).unwrap_or_default().to_owned();
            send_turn_event(current_turn, RuntimeEvent::Error { code, message }).await;
        }
        "turn/done" => {
            let stop_reason = value.get("stopReason").and_then(Value::as_str).map(str::to_owned);
            send_turn_event(current_turn, RuntimeEvent::Done { stop_reason }).await;
            let mut guard = current_turn.lock().await;
            *guard = None;
        }
        "capabilities/result" | "status/result" | "ack" | "error" => {
            if let Some(id) = request_id {
                let mut guard = pending_control.lock().await;
                if let Some(tx) = guard.remove(&id) {
                    let _ = tx.send(value);
                }
            }
        }
        "initialized" => {
            // Already consumed synchronously during the handshake; if it
            // arrives again (misbehaving agent), ignore.
        }
        other => {
            debug!(session_key, method = other, "process runtime reader: unknown message type, skipping");
        }
    }
}

async fn send_turn_event(current_turn: &CurrentTurnSlot, event: RuntimeEvent) {
    let guard = current_turn.lock().await;
    if let Some(tx) = guard.as_ref() {
        let _ = tx.send(event).await;
    }
}

async fn finish_in_flight_turn(current_turn: &CurrentTurnSlot, reason: &str) {
    let mut guard = current_turn.lock().await;
    if let Some(tx) = guard.take() {
        let _ = tx
            .send(RuntimeEvent::Error {
                code: "backend_unavailable".to_owned(),
                message: reason.to_owned(),
            })
            .await;
        let _ = tx.send(RuntimeEvent::Done { stop_reason: Some("process_exited".to_owned()) }).await;
    }
}
