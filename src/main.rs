#![forbid(unsafe_code)]

//! `openclaw-core` demo binary.
//!
//! This is not a production transport. It exists only to exercise the
//! library end-to-end (§1.2): it loads [`GlobalConfig`], boots an
//! [`AcpSessionManager`] backed by a [`ProcessRuntimeBackend`], exposes a
//! minimal `/healthz` + `/metrics` observability surface over HTTP, and
//! reads newline-delimited JSON [`InboundFrame`]s from stdin so the full
//! inbound pipeline can be driven without a real chat backend attached.
//! Replies are written to stdout, one JSON object per line.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use openclaw_core::acp::process_runtime::ProcessRuntimeBackend;
use openclaw_core::acp::registry::BackendRegistry;
use openclaw_core::config::GlobalConfig;
use openclaw_core::config_watcher::ConfigWatcher;
use openclaw_core::inbound::dispatch::{FallbackResolver, InboundDispatcher, RoutingContext, SystemEventsSink};
use openclaw_core::model::{session_key, InboundFrame, ReplyPayload};
use openclaw_core::persistence::db;
use openclaw_core::persistence::metadata_store::SessionMetadataStore;
use openclaw_core::persistence::pairing_repo::PairingStore;
use openclaw_core::reply_dispatcher::{HumanDelayProfile, OutboundSink, ReplyDispatcher, ReplyKind};
use openclaw_core::session::manager::AcpSessionManager;
use openclaw_core::{AppError, Result};

/// Writes every outbound reply as one JSON line on stdout — the demo's
/// stand-in for a real transport adapter.
struct StdoutSink {
    stdout: AsyncMutex<tokio::io::Stdout>,
}

impl StdoutSink {
    fn new() -> Self {
        Self {
            stdout: AsyncMutex::new(tokio::io::stdout()),
        }
    }
}

#[async_trait::async_trait]
impl OutboundSink for StdoutSink {
    async fn deliver(&self, kind: ReplyKind, payload: ReplyPayload) -> Result<()> {
        let line = json!({
            "kind": format!("{kind:?}"),
            "payload": payload,
        });
        let mut out = self.stdout.lock().await;
        out.write_all(line.to_string().as_bytes())
            .await
            .map_err(|err| AppError::Io(err.to_string()))?;
        out.write_all(b"\n").await.map_err(|err| AppError::Io(err.to_string()))?;
        out.flush().await.map_err(|err| AppError::Io(err.to_string()))?;
        Ok(())
    }
}

/// Logs the one-time "session ids resolved" notice via `tracing` — the
/// demo binary's stand-in for a real activity-log subscriber.
struct TracingSystemEvents;

impl SystemEventsSink for TracingSystemEvents {
    fn enqueue(&self, text: &str, session_key: &str, context_key: &str) {
        info!(%session_key, %context_key, %text, "system event enqueued");
    }
}

/// A fallback resolver that echoes the inbound text back — used only when
/// a frame does not route to any ACP agent.
struct EchoFallback;

#[async_trait::async_trait]
impl FallbackResolver for EchoFallback {
    async fn resolve(&self, frame: &InboundFrame, _history_envelope: Option<&str>) -> Result<ReplyPayload> {
        Ok(ReplyPayload::text(format!("(no agent configured) you said: {}", frame.text)))
    }
}

#[derive(Clone)]
struct ObservabilityState {
    manager: Arc<AcpSessionManager>,
    config: Arc<GlobalConfig>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<ObservabilityState>) -> Json<Value> {
    let snapshot = state.manager.get_observability_snapshot(&state.config.acp).await;
    Json(json!({
        "runtimeCache": {
            "activeSessions": snapshot.runtime_cache.active_sessions,
            "idleTtlMs": snapshot.runtime_cache.idle_ttl_ms,
            "evictedTotal": snapshot.runtime_cache.evicted_total,
            "lastEvictedAt": snapshot.runtime_cache.last_evicted_at,
        },
        "turns": {
            "active": snapshot.turns.active,
            "queueDepth": snapshot.turns.queue_depth,
            "completed": snapshot.turns.completed,
            "failed": snapshot.turns.failed,
            "averageLatencyMs": snapshot.turns.average_latency_ms,
            "maxLatencyMs": snapshot.turns.max_latency_ms,
        },
        "errorsByCode": snapshot.errors_by_code,
    }))
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_output = std::env::var("OPENCLAW_LOG_FORMAT").as_deref() == Ok("json");
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);

    let result = if json_output {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    result.map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))
}

fn config_path() -> PathBuf {
    std::env::var("OPENCLAW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"))
}

fn db_path() -> String {
    std::env::var("OPENCLAW_DB_PATH").unwrap_or_else(|_| "openclaw-core.db".to_owned())
}

fn http_addr() -> String {
    let port = std::env::var("OPENCLAW_HTTP_PORT").unwrap_or_else(|_| "8080".to_owned());
    format!("0.0.0.0:{port}")
}

fn main() -> Result<()> {
    init_tracing()?;
    info!("openclaw-core demo binary bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run())
}

async fn run() -> Result<()> {
    let path = config_path();
    let config = Arc::new(GlobalConfig::load_from_path(&path).unwrap_or_else(|err| {
        warn!(%err, path = %path.display(), "failed to load config; falling back to defaults");
        GlobalConfig::default()
    }));
    info!(path = %path.display(), "configuration loaded");

    let db = db::connect(&db_path()).await?;
    info!("database connected");

    let metadata_store = SessionMetadataStore::new(db.clone());
    let pairing_store = PairingStore::new(db);

    let mut registry = BackendRegistry::new();
    let host_cli = std::env::var("OPENCLAW_HOST_CLI").unwrap_or_else(|_| "openclaw-agent-host".to_owned());
    let host_cli_args: Vec<String> = std::env::var("OPENCLAW_HOST_CLI_ARGS")
        .map(|raw| raw.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default();
    registry.register(Arc::new(ProcessRuntimeBackend::new(
        "process",
        host_cli,
        host_cli_args,
        config.workspace_root.clone(),
    )));

    let manager = Arc::new(AcpSessionManager::new(metadata_store, registry));

    let reconcile = manager.reconcile_pending_session_identities(&config.acp).await;
    info!(
        checked = reconcile.checked,
        resolved = reconcile.resolved,
        failed = reconcile.failed,
        "startup identity reconciliation complete"
    );

    let policies = match ConfigWatcher::new(&path) {
        Ok(watcher) => Arc::new(watcher),
        Err(err) => {
            warn!(%err, "failed to start config hot-reload watcher; falling back to watching the process cwd");
            // Watching the config path failed (e.g. it does not exist yet);
            // fall back to a watcher over the process cwd so every channel
            // still resolves to its default policy.
            Arc::new(ConfigWatcher::new(std::path::Path::new("."))?)
        }
    };

    let dispatcher = InboundDispatcher::new(
        Arc::clone(&manager),
        Arc::clone(&policies),
        pairing_store,
        config.inbound.dedup_ttl_ms,
        config.inbound.dedup_max_size,
        config.channels.values().map(|c| c.history_limit).max().unwrap_or(20),
        config.commands,
        config.acp.clone(),
        config.inbound.abort_commands.clone(),
        config.inbound.pairing_grace_ms,
        Some(Arc::new(TracingSystemEvents) as Arc<dyn SystemEventsSink>),
    );

    let ct = CancellationToken::new();
    let http_state = ObservabilityState {
        manager: Arc::clone(&manager),
        config: Arc::clone(&config),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(http_state);

    let addr = http_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| AppError::Io(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, "observability surface listening");

    let http_ct = ct.clone();
    let http_handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            http_ct.cancelled().await;
        });
        if let Err(err) = serve.await {
            error!(%err, "observability http server failed");
        }
    });

    let reply_dispatcher = ReplyDispatcher::new(Arc::new(StdoutSink::new()), None, 3_500, HumanDelayProfile::instant());
    let fallback = EchoFallback;

    run_stdin_loop(&dispatcher, &reply_dispatcher, &fallback).await;

    ct.cancel();
    let _ = http_handle.await;
    info!("openclaw-core demo binary shut down");
    Ok(())
}

/// Reads newline-delimited JSON [`InboundFrame`]s from stdin until EOF,
/// dispatching each one in turn. Malformed lines are logged and skipped
/// rather than aborting the loop.
async fn run_stdin_loop(dispatcher: &InboundDispatcher, reply_dispatcher: &ReplyDispatcher, fallback: &EchoFallback) {
    if std::io::stdin().is_terminal() {
        info!("stdin is a terminal; paste newline-delimited JSON InboundFrames, or pipe a file in");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let next = lines.next_line().await;
        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                error!(%err, "stdin read error");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame: InboundFrame = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "skipping malformed inbound frame line");
                continue;
            }
        };

        let routing = Some(RoutingContext {
            session_key: session_key(&frame.account_id, &format!("acp:{}", frame.conversation_id)),
            agent: frame.account_id.clone(),
            reply_surface: None,
            route_reply_sink: None,
        });

        if let Err(err) = dispatcher.handle(frame, routing, fallback, None, reply_dispatcher).await {
            error!(%err, "inbound frame dispatch failed");
        }
    }
}
