//! Inbound Dispatch (§4.10): orchestrates one inbound message end-to-end
//! — fast abort, dedupe, hooks, access control, mention gating, routing
//! between the ACP session manager and a fallback resolver, reasoning
//! suppression, and post-turn bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::access_control::{self, Decision as AccessDecision};
use crate::config::{AcpConfig, ChannelPolicy, CommandsConfig, StreamConfig};
use crate::config_watcher::ConfigWatcher;
use crate::errors::AppError;
use crate::inbound::dedup::Dedup;
use crate::inbound::history::HistoryAggregator;
use crate::inbound::mention_gate::should_process_group_message;
use crate::model::{HistoryEntry, IdentityState, InboundFrame, ReplyPayload, ResolvedSession, RuntimeEvent, SessionIdentity, TurnMode};
use crate::persistence::pairing_repo::PairingStore;
use crate::reply_dispatcher::{OutboundSink, ReplyDispatcher};
use crate::session::manager::AcpSessionManager;
use crate::Result;

/// Where a frame's routed agent lives, supplied by the caller (the
/// channel/account → agent mapping is outside this crate's scope, §1).
#[derive(Clone)]
pub struct RoutingContext {
    /// The ACP session key (`agent:<id>:<scope>`) this frame maps to.
    pub session_key: String,
    /// The agent id the session key routes to, for `allowedAgents` checks.
    pub agent: String,
    /// The surface this session's replies must actually be delivered to,
    /// if it differs from the frame's own `surface` (§4.10 step 5:
    /// cross-posting agents whose session lives on one surface but whose
    /// replies are addressed to another). `None` means replies go back
    /// through the frame's originating surface via the local dispatcher.
    pub reply_surface: Option<String>,
    /// The "route-reply adapter" sink used instead of the local
    /// dispatcher's own sink when `reply_surface` differs from the
    /// frame's surface. Ignored when `reply_surface` is `None`.
    pub route_reply_sink: Option<Arc<dyn OutboundSink>>,
}

impl std::fmt::Debug for RoutingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingContext")
            .field("session_key", &self.session_key)
            .field("agent", &self.agent)
            .field("reply_surface", &self.reply_surface)
            .field("route_reply_sink", &self.route_reply_sink.is_some())
            .finish()
    }
}

/// Publishes a user-visible activity log entry (§6 `enqueueSystemEvent`),
/// keyed by `(session_key, context_key)` so a subscriber can de-duplicate
/// repeat notices. Grounded on the teacher's `AuditLogger` trait shape.
pub trait SystemEventsSink: Send + Sync {
    /// Record `text` under `(session_key, context_key)`.
    fn enqueue(&self, text: &str, session_key: &str, context_key: &str);
}

/// Last-resort reply source when a message does not route through ACP
/// (§4.10 step 5, "otherwise invoke the supplied fallback resolver").
#[async_trait]
pub trait FallbackResolver: Send + Sync {
    /// Produce the final reply for a message that isn't ACP-routed.
    ///
    /// # Errors
    ///
    /// Implementations return their own failure as an [`AppError`].
    async fn resolve(&self, frame: &InboundFrame, history_envelope: Option<&str>) -> Result<ReplyPayload>;
}

/// External hook contract (§4.10 step 3): fired for every inbound message
/// once it passes dedup, regardless of the eventual routing decision.
pub trait Hooks: Send + Sync {
    /// `message_received` hook.
    fn message_received(&self, frame: &InboundFrame);
}

fn is_reasoning_tool(tool: &str) -> bool {
    tool.eq_ignore_ascii_case("reasoning") || tool.eq_ignore_ascii_case("thinking")
}

async fn flush_block(dispatcher: &ReplyDispatcher, buffer: &mut String) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    dispatcher.send_block_reply(ReplyPayload::text(buffer.clone())).await?;
    buffer.clear();
    Ok(())
}

/// Drain a runtime event stream into coalesced block replies (§4.10 step
/// 5: "chunks `text_delta` into block replies coalesced by an idle window
/// and a per-channel max chunk size"), dropping reasoning-tagged tool
/// output (§4.10 step 6). Returns any text left unflushed when the stream
/// ends, for the caller to send as the final reply.
async fn stream_into_dispatcher(
    mut rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    dispatcher: ReplyDispatcher,
    stream_cfg: StreamConfig,
) -> Result<String> {
    let mut buffer = String::new();
    let idle = Duration::from_millis(stream_cfg.coalesce_idle_ms);
    let mut last_activity = tokio::time::Instant::now();

    loop {
        let deadline = last_activity + idle;
        tokio::select! {
            biased;
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(RuntimeEvent::TextDelta { text }) => {
                        buffer.push_str(&text);
                        last_activity = tokio::time::Instant::now();
                        if buffer.chars().count() >= stream_cfg.max_chunk_chars {
                            flush_block(&dispatcher, &mut buffer).await?;
                        }
                    }
                    Some(RuntimeEvent::ToolResult { tool, output, media_urls }) => {
                        flush_block(&dispatcher, &mut buffer).await?;
                        if !is_reasoning_tool(&tool) {
                            let payload = ReplyPayload {
                                text: if output.is_empty() { None } else { Some(output) },
                                media_urls,
                                ..ReplyPayload::default()
                            };
                            dispatcher.send_tool_result(payload).await?;
                        }
                    }
                    Some(RuntimeEvent::Error { .. }) => {
                        // Keep draining; `run_turn` raises once the stream ends.
                    }
                    Some(RuntimeEvent::Done { .. }) | None => break,
                }
            }
            () = tokio::time::sleep_until(deadline), if !buffer.is_empty() => {
                flush_block(&dispatcher, &mut buffer).await?;
                last_activity = tokio::time::Instant::now();
            }
        }
    }

    Ok(buffer)
}

/// Orchestrates the inbound pipeline described in §4.7-§4.10: dedup,
/// access control, mention gating, history, and routing between the ACP
/// session manager and a fallback resolver.
pub struct InboundDispatcher {
    manager: Arc<AcpSessionManager>,
    policies: Arc<ConfigWatcher>,
    pairing_store: PairingStore,
    dedup: Dedup,
    history: HistoryAggregator,
    commands_cfg: CommandsConfig,
    acp_cfg: AcpConfig,
    abort_commands: Vec<String>,
    pairing_grace_ms: i64,
    system_events: Option<Arc<dyn SystemEventsSink>>,
}

impl InboundDispatcher {
    /// Build a dispatcher from its collaborators and static configuration.
    /// `system_events` is optional — when absent, the one-time "session
    /// ids resolved" notice (§4.10 step 7) is simply not posted.
    #[must_use]
    pub fn new(
        manager: Arc<AcpSessionManager>,
        policies: Arc<ConfigWatcher>,
        pairing_store: PairingStore,
        dedup_ttl_ms: i64,
        dedup_max_size: usize,
        history_limit: usize,
        commands_cfg: CommandsConfig,
        acp_cfg: AcpConfig,
        abort_commands: Vec<String>,
        pairing_grace_ms: i64,
        system_events: Option<Arc<dyn SystemEventsSink>>,
    ) -> Self {
        Self {
            manager,
            policies,
            pairing_store,
            dedup: Dedup::new(dedup_ttl_ms, dedup_max_size),
            history: HistoryAggregator::new(history_limit),
            commands_cfg,
            acp_cfg,
            abort_commands,
            pairing_grace_ms,
            system_events,
        }
    }

    fn channel_policy(&self, frame: &InboundFrame) -> ChannelPolicy {
        self.policies.channel_policy(&frame.provider)
    }

    /// Handle one already-debounced frame end-to-end (§4.10).
    ///
    /// `routing` is `None` when the caller could not map this frame to any
    /// agent (e.g. an unconfigured channel) — such frames always fall
    /// through to `fallback`.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures in the fallback resolver or the
    /// reply dispatcher itself; policy rejections are reported as replies,
    /// not as `Err`.
    #[instrument(skip(self, frame, routing, fallback, hooks, dispatcher), fields(conversation = %frame.conversation_key()))]
    pub async fn handle(
        &self,
        frame: InboundFrame,
        routing: Option<RoutingContext>,
        fallback: &dyn FallbackResolver,
        hooks: Option<&dyn Hooks>,
        dispatcher: &ReplyDispatcher,
    ) -> Result<()> {
        // Step 1: fast abort.
        let trimmed_text = frame.text.trim();
        if !trimmed_text.is_empty()
            && self.abort_commands.iter().any(|c| c.eq_ignore_ascii_case(trimmed_text))
        {
            if let Some(routing) = &routing {
                if let Err(err) = self.manager.cancel_session(&routing.session_key, "inbound-abort-command").await {
                    warn!(%err, session_key = %routing.session_key, "abort command: cancel failed");
                }
            }
            dispatcher.send_final_reply(ReplyPayload::text("Okay, stopping.")).await?;
            return Ok(());
        }

        // Step 2: dedupe.
        if self.dedup.check(&frame.dedup_key()) {
            debug!(message_id = %frame.message_id, "dropping duplicate inbound frame");
            return Ok(());
        }

        // Step 3: hooks.
        if let Some(hooks) = hooks {
            hooks.message_received(&frame);
        }
        if let Some(routing) = &routing {
            debug!(session_key = %routing.session_key, "message:received");
        }

        // Step 4: diagnostics.
        info!(
            provider = %frame.provider,
            conversation = %frame.conversation_id,
            is_group = frame.is_group,
            "processing inbound frame"
        );

        let policy = self.channel_policy(&frame);
        let conversation_key = frame.conversation_key();

        // Access control.
        let store_allow_from = self
            .pairing_store
            .read_store_allow_from_for_dm_policy(&frame.provider, &frame.account_id)
            .await?;

        let decision = if frame.is_group {
            access_control::evaluate_group(&policy, &frame.sender_id, frame.sender_name.as_deref())
        } else {
            access_control::evaluate_dm(
                &policy,
                &frame.provider,
                &frame.account_id,
                &frame.sender_id,
                frame.sender_name.as_deref(),
                &store_allow_from,
                frame.timestamp,
                self.pairing_grace_ms,
                &self.pairing_store,
            )
            .await?
        };

        match decision {
            AccessDecision::Block(reason) => {
                debug!(reason = reason.as_str(), "access control blocked message");
                if frame.is_group {
                    self.history.record(&conversation_key, history_entry(&frame));
                }
                return Ok(());
            }
            AccessDecision::Pairing { code, freshly_created } => {
                if freshly_created {
                    dispatcher
                        .send_final_reply(ReplyPayload::text(format!(
                            "You're not recognized yet. Send this code to an admin to get paired: {code}"
                        )))
                        .await?;
                }
                return Ok(());
            }
            AccessDecision::Allow => {}
        }

        // Mention & command gating (§4.9), groups only.
        if frame.is_group {
            let is_command = self.commands_cfg.text && access_control::is_control_command(&frame.text, &policy.command_prefixes);
            let command_authorized = !self.commands_cfg.use_access_groups
                || access_control::is_command_authorized(
                    &policy,
                    true,
                    &frame.sender_id,
                    frame.sender_name.as_deref(),
                    &store_allow_from,
                );
            let transport_detected_mention = false;
            let should_process = should_process_group_message(
                &frame.text,
                &policy,
                transport_detected_mention,
                is_command && command_authorized,
            );
            if !should_process {
                self.history.record(&conversation_key, history_entry(&frame));
                return Ok(());
            }
        }

        let history_envelope = if frame.is_group {
            self.history.take_envelope(&conversation_key)
        } else {
            None
        };

        // Step 5: routing decision.
        let Some(routing) = routing else {
            let payload = fallback.resolve(&frame, history_envelope.as_deref()).await?;
            dispatcher.send_final_reply(payload).await?;
            return Ok(());
        };

        let resolved = self.manager.resolve_session(&routing.session_key).await?;
        match resolved {
            ResolvedSession::Ready(meta) => {
                let permitted = self.acp_cfg.enabled
                    && self.acp_cfg.dispatch.enabled
                    && (self.acp_cfg.allowed_agents.is_empty() || self.acp_cfg.allowed_agents.contains(&meta.agent));
                if !permitted {
                    dispatcher
                        .send_final_reply(ReplyPayload::text(
                            AppError::acp(crate::errors::AcpErrorCode::DispatchDisabled, "ACP dispatch is disabled for this agent").to_string(),
                        ))
                        .await?;
                    return Ok(());
                }

                // Cross-channel routing: if this session's replies are
                // addressed to a surface other than the one the frame
                // arrived on, suppress typing (it would show on the wrong
                // surface) and swap in the route-reply adapter sink.
                let routed_dispatcher;
                let effective_dispatcher = match &routing.reply_surface {
                    Some(surface) if surface != &frame.surface => {
                        let mut adapted = dispatcher.clone().with_typing_suppressed(true);
                        if let Some(sink) = &routing.route_reply_sink {
                            adapted = adapted.with_sink(Arc::clone(sink));
                        }
                        routed_dispatcher = adapted;
                        &routed_dispatcher
                    }
                    _ => dispatcher,
                };

                self.run_acp_turn(&frame, &routing, history_envelope.as_deref(), meta.identity.as_ref(), effective_dispatcher)
                    .await?;
            }
            ResolvedSession::Stale => {
                dispatcher
                    .send_final_reply(ReplyPayload::text(
                        AppError::acp(crate::errors::AcpErrorCode::SessionInitFailed, "ACP metadata is missing").to_string(),
                    ))
                    .await?;
            }
            ResolvedSession::None => {
                let payload = fallback.resolve(&frame, history_envelope.as_deref()).await?;
                dispatcher.send_final_reply(payload).await?;
            }
        }

        Ok(())
    }

    async fn run_acp_turn(
        &self,
        frame: &InboundFrame,
        routing: &RoutingContext,
        history_envelope: Option<&str>,
        identity_before: Option<&SessionIdentity>,
        dispatcher: &ReplyDispatcher,
    ) -> Result<()> {
        let text = match history_envelope {
            Some(envelope) if !envelope.is_empty() => format!("{envelope}\n{}", frame.text),
            _ => frame.text.clone(),
        };

        let (tx, rx) = mpsc::unbounded_channel::<RuntimeEvent>();
        let stream_cfg = self.acp_cfg.stream;
        let consumer_dispatcher = dispatcher.clone();
        let consumer = tokio::spawn(stream_into_dispatcher(rx, consumer_dispatcher, stream_cfg));

        let turn_result = self
            .manager
            .run_turn(
                &self.acp_cfg,
                &routing.session_key,
                &text,
                TurnMode::Prompt,
                &frame.message_id,
                None,
                &mut |event: &RuntimeEvent| {
                    let _ = tx.send(event.clone());
                },
            )
            .await;
        drop(tx);

        let leftover = consumer
            .await
            .map_err(|err| AppError::Io(format!("stream consumer task panicked: {err}")))??;

        match turn_result {
            Ok(()) => {
                if !leftover.is_empty() {
                    dispatcher.send_final_reply(ReplyPayload::text(leftover)).await?;
                } else {
                    dispatcher.mark_complete();
                }
            }
            Err(err) => {
                dispatcher.send_final_reply(ReplyPayload::text(err.to_string())).await?;
            }
        }

        self.notify_if_identity_just_resolved(routing, identity_before).await;

        Ok(())
    }

    /// Post the one-time "session ids resolved" notice (§4.10 step 7) iff
    /// `identity_before` was `pending` and the manager's post-turn
    /// reconciliation just corroborated it to `resolved`.
    async fn notify_if_identity_just_resolved(&self, routing: &RoutingContext, identity_before: Option<&SessionIdentity>) {
        let Some(sink) = &self.system_events else { return };
        let was_pending = identity_before.is_some_and(|identity| identity.state == IdentityState::Pending);
        if !was_pending {
            return;
        }

        let now_resolved = matches!(
            self.manager.resolve_session(&routing.session_key).await,
            Ok(ResolvedSession::Ready(meta)) if meta.identity.as_ref().is_some_and(|identity| identity.state == IdentityState::Resolved)
        );
        if now_resolved {
            sink.enqueue("session ids resolved", &routing.session_key, "identity-resolved");
        }
    }
}

fn history_entry(frame: &InboundFrame) -> HistoryEntry {
    HistoryEntry {
        sender: frame.sender_name.clone().unwrap_or_else(|| frame.sender_id.clone()),
        body: frame.text.clone(),
        timestamp: Some(frame.timestamp),
        message_id: Some(frame.message_id.clone()),
    }
}
