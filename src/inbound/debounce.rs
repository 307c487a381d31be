//! Inbound Debouncer (§4.7): buffers frames per conversation until
//! `idleMs` elapses since the last frame, then flushes a single merged
//! frame. Frames that should never wait — empty text, media, control
//! commands — flush immediately instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::model::InboundFrame;

/// Whether `frame` should be buffered (`true`) or flushed immediately
/// (`false`): empty text, media-bearing frames, and control commands
/// always flush immediately (§4.7).
#[must_use]
pub fn should_debounce(frame: &InboundFrame, command_prefixes: &[String]) -> bool {
    if frame.text.trim().is_empty() {
        return false;
    }
    if frame.has_media() {
        return false;
    }
    if crate::access_control::is_control_command(&frame.text, command_prefixes) {
        return false;
    }
    true
}

/// Merge buffered frames into one: texts joined by newlines, every other
/// field inherited from the last frame, message ids joined with a comma
/// so the combined list survives in `InboundFrame`'s single `messageId`
/// field downstream. `None` iff `frames` is empty.
#[must_use]
fn merge_frames(mut frames: Vec<InboundFrame>) -> Option<InboundFrame> {
    let mut merged = frames.pop()?;
    if frames.is_empty() {
        return Some(merged);
    }

    let mut texts: Vec<String> = frames.iter().map(|f| f.text.clone()).collect();
    texts.push(merged.text.clone());
    merged.text = texts.into_iter().filter(|t| !t.is_empty()).collect::<Vec<_>>().join("\n");

    let mut ids: Vec<String> = frames.iter().map(|f| f.message_id.clone()).collect();
    ids.push(merged.message_id.clone());
    merged.message_id = ids.join(",");

    Some(merged)
}

struct ConversationBuffer {
    frames: Vec<InboundFrame>,
    generation: u64,
}

type FlushFn = dyn Fn(InboundFrame) -> BoxFuture<'static, ()> + Send + Sync;

/// Per-conversation frame debouncer. Must be held behind an `Arc` so the
/// idle-flush timers it spawns can hold a reference back to it.
pub struct Debouncer {
    idle_ms: u64,
    on_flush: Arc<FlushFn>,
    buffers: Mutex<HashMap<String, ConversationBuffer>>,
}

impl Debouncer {
    /// Build a debouncer with the given idle window. `on_flush` is called
    /// with the single merged frame once a conversation goes idle (or
    /// immediately, for frames that bypass debouncing).
    #[must_use]
    pub fn new(idle_ms: u64, on_flush: impl Fn(InboundFrame) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            idle_ms,
            on_flush: Arc::new(on_flush),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Submit a frame. Frames that fail [`should_debounce`] flush on the
    /// spot; others are buffered and a fresh idle timer is armed,
    /// superseding any timer already pending for that conversation.
    pub fn submit(self: &Arc<Self>, frame: InboundFrame, command_prefixes: &[String]) {
        if !should_debounce(&frame, command_prefixes) {
            let on_flush = Arc::clone(&self.on_flush);
            tokio::spawn(async move { on_flush(frame).await });
            return;
        }

        let key = frame.conversation_key();
        let generation = {
            let mut buffers = self.buffers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let buf = buffers.entry(key.clone()).or_insert_with(|| ConversationBuffer {
                frames: Vec::new(),
                generation: 0,
            });
            buf.frames.push(frame);
            buf.generation += 1;
            buf.generation
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(this.idle_ms)).await;
            this.try_flush(&key, generation).await;
        });
    }

    async fn try_flush(&self, key: &str, generation: u64) {
        let frames = {
            let mut buffers = self.buffers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match buffers.get(key) {
                Some(buf) if buf.generation == generation => {
                    buffers.remove(key).map(|buf| buf.frames)
                }
                _ => None,
            }
        };
        let Some(frames) = frames else { return };
        let Some(merged) = merge_frames(frames) else { return };
        (self.on_flush)(merged).await;
    }

    /// Number of frames currently buffered for a conversation (diagnostics).
    #[must_use]
    pub fn pending_count(&self, conversation_key: &str) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(conversation_key)
            .map_or(0, |buf| buf.frames.len())
    }
}
