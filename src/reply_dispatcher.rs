//! Reply Dispatcher (§4.11): a typed tri-sink (`sendToolResult`,
//! `sendBlockReply`, `sendFinalReply`) that drives typing indicators,
//! paces final replies with a per-agent human-delay distribution, and
//! pre-chunks text per transport limits.
//!
//! The actual delivery transport and the markdown-table-aware chunker are
//! external collaborators (§1): this module defines their contracts
//! ([`OutboundSink`], [`TextChunker`]) and a sane default chunker, the way
//! the ACP runtime backend registry (§4.4/§4.5) treats the runtime itself
//! as a polymorphic collaborator behind a trait object.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;
use tracing::instrument;

use crate::model::ReplyPayload;
use crate::Result;

/// Which of the tri-sink a delivery came through, for queue-depth
/// reporting (§4.11 `getQueuedCounts`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    /// An intermediate tool-invocation result.
    ToolResult,
    /// An intermediate streamed block.
    BlockReply,
    /// The terminal reply for a turn.
    FinalReply,
}

/// The destination a [`ReplyDispatcher`] delivers payloads to. A real
/// implementation wraps a transport client (Slack, Discord, Mattermost,
/// …); this crate only depends on the contract.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Deliver one payload. Called once per chunk/media item.
    ///
    /// # Errors
    ///
    /// Implementations return their transport's error, wrapped as
    /// `AppError::Io` or similar.
    async fn deliver(&self, kind: ReplyKind, payload: ReplyPayload) -> Result<()>;
}

/// Typing-indicator control, driven around block/final sends. Typing
/// failures are tolerated — a dispatcher never fails a reply because the
/// typing indicator couldn't be shown.
#[async_trait]
pub trait TypingIndicator: Send + Sync {
    /// Start (or refresh) the typing indicator.
    async fn start(&self);
    /// Called when a delivery attempt fails, so the indicator can be
    /// cleared without waiting for its own timeout.
    async fn on_error(&self);
}

/// Splits text into transport-sized chunks. The default implementation
/// below is a naive whitespace-preferring splitter; callers that need
/// markdown-table-aware wrapping supply their own.
pub trait TextChunker: Send + Sync {
    /// Split `text` into chunks no larger than `limit` characters.
    fn chunk(&self, text: &str, limit: usize) -> Vec<String>;
}

/// Splits on the last whitespace before `limit`, falling back to a hard
/// cut when a single token exceeds the limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTextChunker;

impl TextChunker for DefaultTextChunker {
    fn chunk(&self, text: &str, limit: usize) -> Vec<String> {
        if limit == 0 || text.chars().count() <= limit {
            return vec![text.to_owned()];
        }

        let mut chunks = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let remaining = chars.len() - start;
            if remaining <= limit {
                chunks.push(chars[start..].iter().collect());
                break;
            }
            let window_end = start + limit;
            let break_at = chars[start..window_end]
                .iter()
                .rposition(|c| c.is_whitespace())
                .map_or(window_end, |offset| start + offset);
            let break_at = if break_at == start { window_end } else { break_at };
            chunks.push(chars[start..break_at].iter().collect::<String>().trim_end().to_owned());
            start = break_at;
            while start < chars.len() && chars[start].is_whitespace() {
                start += 1;
            }
        }
        chunks.into_iter().filter(|c| !c.is_empty()).collect()
    }
}

/// A per-agent human-delay distribution used to pace final replies
/// (§4.11): a base delay plus a per-character component and bounded
/// jitter, so replies don't arrive suspiciously instantaneously.
#[derive(Debug, Clone, Copy)]
pub struct HumanDelayProfile {
    /// Fixed delay floor, in milliseconds.
    pub base_ms: u64,
    /// Additional delay per character of reply text, in milliseconds.
    pub per_char_ms: f64,
    /// Upper bound on the total computed delay, in milliseconds.
    pub max_ms: u64,
    /// Random jitter added on top, uniformly distributed in `[0, jitter_ms]`.
    pub jitter_ms: u64,
}

impl Default for HumanDelayProfile {
    fn default() -> Self {
        Self {
            base_ms: 200,
            per_char_ms: 8.0,
            max_ms: 4_000,
            jitter_ms: 150,
        }
    }
}

impl HumanDelayProfile {
    /// No artificial delay at all — useful for tests and for agents
    /// configured to reply instantly.
    #[must_use]
    pub const fn instant() -> Self {
        Self {
            base_ms: 0,
            per_char_ms: 0.0,
            max_ms: 0,
            jitter_ms: 0,
        }
    }

    fn compute_delay(&self, text_len: usize) -> Duration {
        let scaled = self.base_ms as f64 + self.per_char_ms * text_len as f64;
        let capped = scaled.min(self.max_ms as f64).max(0.0);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(capped as u64 + jitter)
    }
}

#[derive(Default)]
struct QueueCounters {
    tool_result: AtomicUsize,
    block_reply: AtomicUsize,
    final_reply: AtomicUsize,
}

impl QueueCounters {
    fn counter(&self, kind: ReplyKind) -> &AtomicUsize {
        match kind {
            ReplyKind::ToolResult => &self.tool_result,
            ReplyKind::BlockReply => &self.block_reply,
            ReplyKind::FinalReply => &self.final_reply,
        }
    }

    fn total(&self) -> usize {
        self.tool_result.load(Ordering::SeqCst)
            + self.block_reply.load(Ordering::SeqCst)
            + self.final_reply.load(Ordering::SeqCst)
    }
}

/// Queue depth snapshot (§4.11 `getQueuedCounts`).
#[derive(Debug, Clone, Copy, Default)]
pub struct QueuedCounts {
    /// Tool-result deliveries currently in flight.
    pub tool_result: usize,
    /// Block-reply deliveries currently in flight.
    pub block_reply: usize,
    /// Final-reply deliveries currently in flight.
    pub final_reply: usize,
}

/// Typed reply sink described in §4.11.
#[derive(Clone)]
pub struct ReplyDispatcher {
    sink: Arc<dyn OutboundSink>,
    typing: Option<Arc<dyn TypingIndicator>>,
    chunker: Arc<dyn TextChunker>,
    chunk_limit: usize,
    human_delay: HumanDelayProfile,
    suppress_typing: bool,
    counters: Arc<QueueCounters>,
    idle_notify: Arc<Notify>,
}

impl ReplyDispatcher {
    /// Build a dispatcher over `sink`, with an optional typing-indicator
    /// controller, the default whitespace-preferring chunker, and a given
    /// per-transport chunk limit and human-delay profile.
    #[must_use]
    pub fn new(
        sink: Arc<dyn OutboundSink>,
        typing: Option<Arc<dyn TypingIndicator>>,
        chunk_limit: usize,
        human_delay: HumanDelayProfile,
    ) -> Self {
        Self {
            sink,
            typing,
            chunker: Arc::new(DefaultTextChunker),
            chunk_limit,
            human_delay,
            suppress_typing: false,
            counters: Arc::new(QueueCounters::default()),
            idle_notify: Arc::new(Notify::new()),
        }
    }

    /// Override the chunker (§4.10 "route-reply adapter" case and similar
    /// callers that need markdown-table-aware wrapping).
    #[must_use]
    pub fn with_chunker(mut self, chunker: Arc<dyn TextChunker>) -> Self {
        self.chunker = chunker;
        self
    }

    /// Force-suppress the typing indicator for every send on this
    /// dispatcher instance (§4.10: "force `suppressTyping`" when the
    /// originating channel differs from the provider surface).
    #[must_use]
    pub fn with_typing_suppressed(mut self, suppressed: bool) -> Self {
        self.suppress_typing = suppressed;
        self
    }

    /// Swap the delivery sink, keeping every other setting. Used to build
    /// the "route-reply adapter" (§4.10 step 5) that delivers to a
    /// different destination than the local dispatcher's own sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn OutboundSink>) -> Self {
        self.sink = sink;
        self
    }

    async fn start_typing(&self) {
        if self.suppress_typing {
            return;
        }
        if let Some(typing) = &self.typing {
            typing.start().await;
        }
    }

    async fn typing_error(&self) {
        if self.suppress_typing {
            return;
        }
        if let Some(typing) = &self.typing {
            typing.on_error().await;
        }
    }

    async fn deliver_chunks(&self, kind: ReplyKind, payload: &ReplyPayload) -> Result<()> {
        let media_urls = payload.all_media_urls();
        let counter = self.counters.counter(kind);
        counter.fetch_add(1, Ordering::SeqCst);
        let result = self.deliver_chunks_inner(kind, payload, &media_urls).await;
        if counter.fetch_sub(1, Ordering::SeqCst) == 1 && self.counters.total() == 0 {
            self.idle_notify.notify_waiters();
        }
        result
    }

    async fn deliver_chunks_inner(&self, kind: ReplyKind, payload: &ReplyPayload, media_urls: &[String]) -> Result<()> {
        self.start_typing().await;

        if media_urls.is_empty() {
            return self.deliver_text_only(kind, payload).await;
        }

        // Text accompanies only the first media delivery; subsequent
        // sends carry only the media (§4.11).
        for (index, url) in media_urls.iter().enumerate() {
            let mut chunk_payload = ReplyPayload {
                media_url: Some(url.clone()),
                media_urls: Vec::new(),
                is_reasoning: payload.is_reasoning,
                audio_as_voice: payload.audio_as_voice,
                text: if index == 0 { payload.text.clone() } else { None },
            };
            if index == 0 && chunk_payload.text.is_none() {
                chunk_payload.text = None;
            }
            if let Err(err) = self.sink.deliver(kind, chunk_payload).await {
                self.typing_error().await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn deliver_text_only(&self, kind: ReplyKind, payload: &ReplyPayload) -> Result<()> {
        let Some(text) = &payload.text else {
            return self.sink.deliver(kind, payload.clone()).await;
        };

        let chunks = self.chunker.chunk(text, self.chunk_limit);
        for chunk in chunks {
            let chunk_payload = ReplyPayload {
                text: Some(chunk),
                media_url: None,
                media_urls: Vec::new(),
                is_reasoning: payload.is_reasoning,
                audio_as_voice: payload.audio_as_voice,
            };
            if let Err(err) = self.sink.deliver(kind, chunk_payload).await {
                self.typing_error().await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Send a tool-invocation result. A reasoning-tagged tool name is
    /// filtered by the caller before this is reached (§4.10 step 6, §8 P8)
    /// — this sink is the name-based filter's downstream, not its
    /// enforcement point.
    ///
    /// # Errors
    ///
    /// Returns the sink's delivery error.
    #[instrument(skip(self, payload))]
    pub async fn send_tool_result(&self, payload: ReplyPayload) -> Result<()> {
        self.deliver_chunks(ReplyKind::ToolResult, &payload).await
    }

    /// Send an intermediate streamed block reply. A payload tagged
    /// `isReasoning` never reaches the sink (§4.10 step 6, §8 P8/S7).
    ///
    /// # Errors
    ///
    /// Returns the sink's delivery error.
    #[instrument(skip(self, payload))]
    pub async fn send_block_reply(&self, payload: ReplyPayload) -> Result<()> {
        if payload.is_reasoning {
            return Ok(());
        }
        self.deliver_chunks(ReplyKind::BlockReply, &payload).await
    }

    /// Send the final reply for a turn, paced by the configured
    /// human-delay profile. A payload tagged `isReasoning` never reaches
    /// the sink (§4.10 step 6, §8 P8/S7).
    ///
    /// # Errors
    ///
    /// Returns the sink's delivery error.
    #[instrument(skip(self, payload))]
    pub async fn send_final_reply(&self, payload: ReplyPayload) -> Result<()> {
        if payload.is_reasoning {
            return Ok(());
        }
        let text_len = payload.text.as_ref().map_or(0, |t| t.chars().count());
        let delay = self.human_delay.compute_delay(text_len);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.deliver_chunks(ReplyKind::FinalReply, &payload).await
    }

    /// Current in-flight delivery counts per sink (§4.11 `getQueuedCounts`).
    #[must_use]
    pub fn get_queued_counts(&self) -> QueuedCounts {
        QueuedCounts {
            tool_result: self.counters.tool_result.load(Ordering::SeqCst),
            block_reply: self.counters.block_reply.load(Ordering::SeqCst),
            final_reply: self.counters.final_reply.load(Ordering::SeqCst),
        }
    }

    /// Wait until every sink's in-flight count is zero.
    pub async fn wait_for_idle(&self) {
        loop {
            if self.counters.total() == 0 {
                return;
            }
            self.idle_notify.notified().await;
        }
    }

    /// Explicitly mark the current turn's deliveries complete, waking any
    /// `wait_for_idle` caller even if counters are momentarily nonzero due
    /// to a caller holding a send in flight past its own logical turn.
    pub fn mark_complete(&self) {
        self.idle_notify.notify_waiters();
    }
}
