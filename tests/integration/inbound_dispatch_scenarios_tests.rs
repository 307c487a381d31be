//! End-to-end inbound dispatch scenarios (§4.10): fast abort, dedupe,
//! reasoning suppression, stale ACP metadata, and history-envelope
//! aggregation across a gated group conversation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;

use openclaw_core::config::{AcpConfig, CommandsConfig};
use openclaw_core::config_watcher::ConfigWatcher;
use openclaw_core::inbound::{FallbackResolver, InboundDispatcher, RoutingContext, SystemEventsSink};
use openclaw_core::model::{session_key, InboundFrame, ReplyPayload, RuntimeEvent, RuntimeStatus, SessionMode};
use openclaw_core::persistence::db;
use openclaw_core::persistence::pairing_repo::PairingStore;
use openclaw_core::reply_dispatcher::{HumanDelayProfile, OutboundSink, ReplyDispatcher, ReplyKind};
use openclaw_core::Result;

use super::test_helpers::{manager_with_backend, test_acp_config};

struct RecordingSink {
    deliveries: StdMutex<Vec<(ReplyKind, ReplyPayload)>>,
}

impl RecordingSink {
    fn new() -> Self {
        Self {
            deliveries: StdMutex::new(Vec::new()),
        }
    }

    fn deliveries(&self) -> Vec<(ReplyKind, ReplyPayload)> {
        self.deliveries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl OutboundSink for RecordingSink {
    async fn deliver(&self, kind: ReplyKind, payload: ReplyPayload) -> Result<()> {
        self.deliveries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push((kind, payload));
        Ok(())
    }
}

/// A fallback resolver that echoes back a fixed reply, records every call,
/// and captures the history envelope it was handed (if any).
struct RecordingFallback {
    calls: AtomicUsize,
    last_envelope: StdMutex<Option<String>>,
    reply_text: String,
}

impl RecordingFallback {
    fn new(reply_text: impl Into<String>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            last_envelope: StdMutex::new(None),
            reply_text: reply_text.into(),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_envelope(&self) -> Option<String> {
        self.last_envelope.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl FallbackResolver for RecordingFallback {
    async fn resolve(&self, _frame: &InboundFrame, history_envelope: Option<&str>) -> Result<ReplyPayload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_envelope.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = history_envelope.map(str::to_owned);
        Ok(ReplyPayload::text(self.reply_text.clone()))
    }
}

fn frame(provider: &str, is_group: bool, sender_id: &str, text: &str, message_id: &str) -> InboundFrame {
    InboundFrame {
        provider: provider.to_owned(),
        surface: "surface1".to_owned(),
        account_id: "acct1".to_owned(),
        sender_id: sender_id.to_owned(),
        sender_name: None,
        conversation_id: "conv1".to_owned(),
        is_group,
        thread_id: None,
        message_id: message_id.to_owned(),
        text: text.to_owned(),
        media_refs: Vec::new(),
        timestamp: Utc::now(),
        reply_to_id: None,
    }
}

fn dispatcher(sink: Arc<RecordingSink>) -> ReplyDispatcher {
    ReplyDispatcher::new(sink, None, 3_500, HumanDelayProfile::instant())
}

async fn watcher_with_channels(toml: &str) -> (tempfile::TempDir, Arc<ConfigWatcher>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, toml).expect("write config");
    let watcher = Arc::new(ConfigWatcher::new(&path).expect("config watcher"));
    (dir, watcher)
}

async fn pairing_store() -> PairingStore {
    let db = db::connect_memory().await.expect("in-memory db");
    PairingStore::new(db)
}

fn inbound_dispatcher(
    manager: Arc<openclaw_core::session::manager::AcpSessionManager>,
    policies: Arc<ConfigWatcher>,
    pairing: PairingStore,
    acp_cfg: AcpConfig,
) -> InboundDispatcher {
    inbound_dispatcher_with_system_events(manager, policies, pairing, acp_cfg, None)
}

fn inbound_dispatcher_with_system_events(
    manager: Arc<openclaw_core::session::manager::AcpSessionManager>,
    policies: Arc<ConfigWatcher>,
    pairing: PairingStore,
    acp_cfg: AcpConfig,
    system_events: Option<Arc<dyn SystemEventsSink>>,
) -> InboundDispatcher {
    InboundDispatcher::new(
        manager,
        policies,
        pairing,
        300_000,
        2_000,
        20,
        CommandsConfig::default(),
        acp_cfg,
        vec!["/abort".to_owned(), "/stop".to_owned()],
        60_000,
        system_events,
    )
}

#[tokio::test]
async fn abort_command_cancels_the_session_and_skips_the_fallback_resolver() {
    let (manager, backend) = manager_with_backend().await;
    let manager = Arc::new(manager);
    let cfg = test_acp_config(8);
    let key = session_key("agent-a", "acp:1");
    manager
        .initialize_session(&cfg, &key, "agent-a", SessionMode::Persistent, None, None)
        .await
        .expect("init session");

    let (_dir, policies) = watcher_with_channels("").await;
    let pairing = pairing_store().await;
    let dispatch = inbound_dispatcher(Arc::clone(&manager), policies, pairing, cfg);

    let sink = Arc::new(RecordingSink::new());
    let reply_dispatcher = dispatcher(sink.clone());
    let fallback = RecordingFallback::new("should not be used");

    let routing = RoutingContext {
        session_key: key.clone(),
        agent: "agent-a".to_owned(),
        reply_surface: None,
        route_reply_sink: None,
    };

    dispatch
        .handle(frame("dm-chan", false, "alice", "/abort", "m1"), Some(routing), &fallback, None, &reply_dispatcher)
        .await
        .expect("handle abort");

    assert_eq!(backend.cancel_calls(), 1);
    assert_eq!(fallback.calls(), 0);
    let deliveries = sink.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].1.text.as_deref(), Some("Okay, stopping."));
}

#[tokio::test]
async fn duplicate_message_id_is_dispatched_only_once() {
    let (manager, _backend) = manager_with_backend().await;
    let manager = Arc::new(manager);
    let cfg = test_acp_config(8);

    let (_dir, policies) = watcher_with_channels("").await;
    let pairing = pairing_store().await;
    let dispatch = inbound_dispatcher(manager, policies, pairing, cfg);

    let sink = Arc::new(RecordingSink::new());
    let reply_dispatcher = dispatcher(sink.clone());
    let fallback = RecordingFallback::new("echoed");

    let msg = frame("dm-chan", false, "alice", "hello there", "dupe-1");
    dispatch.handle(msg.clone(), None, &fallback, None, &reply_dispatcher).await.expect("first handle");
    dispatch.handle(msg, None, &fallback, None, &reply_dispatcher).await.expect("second handle");

    assert_eq!(fallback.calls(), 1);
    assert_eq!(sink.deliveries().len(), 1);
}

#[tokio::test]
async fn reasoning_tagged_tool_output_never_reaches_the_sink() {
    let (manager, backend) = manager_with_backend().await;
    let manager = Arc::new(manager);
    let cfg = test_acp_config(8);
    let key = session_key("agent-a", "acp:2");
    manager
        .initialize_session(&cfg, &key, "agent-a", SessionMode::Persistent, None, None)
        .await
        .expect("init session");

    backend
        .push_script(vec![
            RuntimeEvent::ToolResult {
                tool: "reasoning".to_owned(),
                output: "internal chain of thought".to_owned(),
                media_urls: Vec::new(),
            },
            RuntimeEvent::TextDelta {
                text: "The answer is 42".to_owned(),
            },
            RuntimeEvent::Done { stop_reason: None },
        ])
        .await;

    let (_dir, policies) = watcher_with_channels("").await;
    let pairing = pairing_store().await;
    let dispatch = inbound_dispatcher(Arc::clone(&manager), policies, pairing, cfg);

    let sink = Arc::new(RecordingSink::new());
    let reply_dispatcher = dispatcher(sink.clone());
    let fallback = RecordingFallback::new("fallback should not be used");

    let routing = RoutingContext {
        session_key: key,
        agent: "agent-a".to_owned(),
        reply_surface: None,
        route_reply_sink: None,
    };

    dispatch
        .handle(frame("dm-chan", false, "alice", "what is the answer?", "m1"), Some(routing), &fallback, None, &reply_dispatcher)
        .await
        .expect("handle turn");

    assert_eq!(fallback.calls(), 0);
    let deliveries = sink.deliveries();
    assert!(deliveries.iter().all(|(kind, _)| *kind != ReplyKind::ToolResult));
    assert!(deliveries.iter().any(|(_, payload)| payload.text.as_deref() == Some("The answer is 42")));
    assert!(deliveries
        .iter()
        .all(|(_, payload)| payload.text.as_deref() != Some("internal chain of thought")));
}

#[tokio::test]
async fn reasoning_tagged_final_reply_from_fallback_never_reaches_the_sink() {
    // Distinct from `reasoning_tagged_tool_output_never_reaches_the_sink`
    // above: that test filters ToolResult events by tool *name*. This one
    // exercises the `ReplyPayload.is_reasoning` flag directly, which the
    // sink must honor regardless of where the payload came from.
    struct ReasoningFallback;

    #[async_trait]
    impl FallbackResolver for ReasoningFallback {
        async fn resolve(&self, _frame: &InboundFrame, _history_envelope: Option<&str>) -> Result<ReplyPayload> {
            Ok(ReplyPayload {
                is_reasoning: true,
                ..ReplyPayload::text("internal chain of thought")
            })
        }
    }

    let (manager, _backend) = manager_with_backend().await;
    let manager = Arc::new(manager);
    let cfg = test_acp_config(8);

    let (_dir, policies) = watcher_with_channels("").await;
    let pairing = pairing_store().await;
    let dispatch = inbound_dispatcher(manager, policies, pairing, cfg);

    let sink = Arc::new(RecordingSink::new());
    let reply_dispatcher = dispatcher(sink.clone());
    let fallback = ReasoningFallback;

    dispatch
        .handle(frame("dm-chan", false, "alice", "hello", "m1"), None, &fallback, None, &reply_dispatcher)
        .await
        .expect("handle reasoning-tagged fallback reply");

    assert!(sink.deliveries().is_empty());
}

#[tokio::test]
async fn acp_shaped_key_with_no_metadata_reports_stale_without_calling_the_backend() {
    let (manager, backend) = manager_with_backend().await;
    let manager = Arc::new(manager);
    let cfg = test_acp_config(8);
    // Never initialized: `resolve_session` must report `Stale` for this
    // acp-shaped key instead of falling through to the fallback resolver.
    let key = session_key("agent-a", "acp:never-initialized");

    let (_dir, policies) = watcher_with_channels("").await;
    let pairing = pairing_store().await;
    let dispatch = inbound_dispatcher(Arc::clone(&manager), policies, pairing, cfg);

    let sink = Arc::new(RecordingSink::new());
    let reply_dispatcher = dispatcher(sink.clone());
    let fallback = RecordingFallback::new("fallback should not be used");

    let routing = RoutingContext {
        session_key: key,
        agent: "agent-a".to_owned(),
        reply_surface: None,
        route_reply_sink: None,
    };

    dispatch
        .handle(frame("dm-chan", false, "alice", "hello", "m1"), Some(routing), &fallback, None, &reply_dispatcher)
        .await
        .expect("handle stale");

    assert_eq!(fallback.calls(), 0);
    assert_eq!(backend.ensure_calls(), 0);
    let deliveries = sink.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].1.text.as_deref().unwrap_or_default().contains("ACP metadata is missing"));
}

#[tokio::test]
async fn cross_surface_routing_forces_typing_suppression_and_uses_the_route_reply_sink() {
    let (manager, backend) = manager_with_backend().await;
    let manager = Arc::new(manager);
    let cfg = test_acp_config(8);
    let key = session_key("agent-a", "acp:4");
    manager
        .initialize_session(&cfg, &key, "agent-a", SessionMode::Persistent, None, None)
        .await
        .expect("init session");

    backend
        .push_script(vec![
            RuntimeEvent::TextDelta {
                text: "reply from the other surface".to_owned(),
            },
            RuntimeEvent::Done { stop_reason: None },
        ])
        .await;

    let (_dir, policies) = watcher_with_channels("").await;
    let pairing = pairing_store().await;
    let dispatch = inbound_dispatcher(Arc::clone(&manager), policies, pairing, cfg);

    // The frame arrives on "surface1" (see `frame()`), but this session's
    // replies are addressed to a different surface — the local sink must
    // never see the reply, only the route-reply adapter's sink does.
    let local_sink = Arc::new(RecordingSink::new());
    let reply_dispatcher = dispatcher(local_sink.clone());
    let route_sink = Arc::new(RecordingSink::new());
    let fallback = RecordingFallback::new("fallback should not be used");

    let routing = RoutingContext {
        session_key: key,
        agent: "agent-a".to_owned(),
        reply_surface: Some("surface2".to_owned()),
        route_reply_sink: Some(route_sink.clone() as Arc<dyn OutboundSink>),
    };

    dispatch
        .handle(frame("dm-chan", false, "alice", "hi", "m1"), Some(routing), &fallback, None, &reply_dispatcher)
        .await
        .expect("handle cross-surface turn");

    assert_eq!(fallback.calls(), 0);
    assert!(local_sink.deliveries().is_empty());
    let routed = route_sink.deliveries();
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].1.text.as_deref(), Some("reply from the other surface"));
}

#[tokio::test]
async fn identity_pending_to_resolved_transition_posts_a_one_time_notice() {
    struct RecordingSystemEvents {
        notices: StdMutex<Vec<(String, String, String)>>,
    }

    impl RecordingSystemEvents {
        fn new() -> Self {
            Self {
                notices: StdMutex::new(Vec::new()),
            }
        }
    }

    impl SystemEventsSink for RecordingSystemEvents {
        fn enqueue(&self, text: &str, session_key: &str, context_key: &str) {
            self.notices
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((text.to_owned(), session_key.to_owned(), context_key.to_owned()));
        }
    }

    let (manager, backend) = manager_with_backend().await;
    let manager = Arc::new(manager);
    let cfg = test_acp_config(8);
    let key = session_key("agent-a", "acp:3");
    // `initialize_session` seeds a pending identity (the backend's
    // `ensure_session` fake always returns a backend session id).
    manager
        .initialize_session(&cfg, &key, "agent-a", SessionMode::Persistent, None, None)
        .await
        .expect("init session");

    // Corroborated by the turn's post-turn `getStatus` reconciliation,
    // flipping the identity from pending to resolved.
    backend
        .set_status(RuntimeStatus {
            summary: "ready".to_owned(),
            backend_session_id: Some(format!("backend-{key}")),
            agent_session_id: Some("agent-session-1".to_owned()),
            acpx_record_id: Some("record-1".to_owned()),
            details: None,
        })
        .await;

    let (_dir, policies) = watcher_with_channels("").await;
    let pairing = pairing_store().await;
    let system_events = Arc::new(RecordingSystemEvents::new());
    let dispatch = inbound_dispatcher_with_system_events(
        Arc::clone(&manager),
        policies,
        pairing,
        cfg,
        Some(system_events.clone() as Arc<dyn SystemEventsSink>),
    );

    let sink = Arc::new(RecordingSink::new());
    let reply_dispatcher = dispatcher(sink.clone());
    let fallback = RecordingFallback::new("fallback should not be used");

    let routing = RoutingContext {
        session_key: key.clone(),
        agent: "agent-a".to_owned(),
        reply_surface: None,
        route_reply_sink: None,
    };

    dispatch
        .handle(frame("dm-chan", false, "alice", "hello", "m1"), Some(routing.clone()), &fallback, None, &reply_dispatcher)
        .await
        .expect("handle first turn");

    let notices = system_events.notices.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].1, key);

    // Identity is already resolved now; a second turn must not re-notify.
    dispatch
        .handle(frame("dm-chan", false, "alice", "hello again", "m2"), Some(routing), &fallback, None, &reply_dispatcher)
        .await
        .expect("handle second turn");
    assert_eq!(system_events.notices.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len(), 1);
}

#[tokio::test]
async fn gated_group_history_flushes_as_one_envelope_once_a_mention_arrives() {
    let (manager, _backend) = manager_with_backend().await;
    let manager = Arc::new(manager);
    let cfg = test_acp_config(8);

    let (_dir, policies) = watcher_with_channels(
        r#"
        [channels.group-chan]
        mentionAliases = ["clawbot"]
        "#,
    )
    .await;
    let pairing = pairing_store().await;
    let dispatch = inbound_dispatcher(manager, policies, pairing, cfg);

    let sink = Arc::new(RecordingSink::new());
    let reply_dispatcher = dispatcher(sink.clone());
    let fallback = RecordingFallback::new("on it");

    // First message carries no mention: requireMention defaults to true, so
    // it is gated out and recorded in the per-conversation history instead
    // of producing any reply.
    dispatch
        .handle(frame("group-chan", true, "alice", "anyone around?", "g1"), None, &fallback, None, &reply_dispatcher)
        .await
        .expect("handle gated message");
    assert_eq!(fallback.calls(), 0);
    assert!(sink.deliveries().is_empty());

    // Second message mentions the bot and is allowed through; the fallback
    // resolver should see the first message folded into its history
    // envelope, and the aggregator's pending entries are cleared by the
    // same call (confirmed by the third message below seeing no envelope).
    dispatch
        .handle(frame("group-chan", true, "alice", "clawbot, can you help?", "g2"), None, &fallback, None, &reply_dispatcher)
        .await
        .expect("handle mentioned message");
    assert_eq!(fallback.calls(), 1);
    assert_eq!(sink.deliveries().len(), 1);
    let envelope = fallback.last_envelope().expect("history envelope present on the mentioned turn");
    assert!(envelope.contains("anyone around?"));

    // A third, again un-mentioned message is gated like the first — but the
    // history it starts accumulating is fresh, not the already-flushed one.
    dispatch
        .handle(frame("group-chan", true, "alice", "thanks!", "g3"), None, &fallback, None, &reply_dispatcher)
        .await
        .expect("handle trailing gated message");
    assert_eq!(fallback.calls(), 1);
    assert_eq!(sink.deliveries().len(), 1);
}
