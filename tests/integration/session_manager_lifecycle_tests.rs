//! `AcpSessionManager` lifecycle: `initializeSession` → `runTurn` →
//! `getSessionStatus` → `closeSession`, plus `cancelSession` against an
//! idle session.

use std::sync::Arc;
use std::time::Duration;

use openclaw_core::errors::AcpErrorCode;
use openclaw_core::model::{RuntimeEvent, SessionMode, SessionState, TurnMode};

use super::test_helpers::{manager_with_backend, test_acp_config};

// ── initializeSession ───────────────────────────────────────────────

#[tokio::test]
async fn initialize_session_persists_idle_metadata_and_caches_a_handle() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);

    let meta = manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("initialize_session should succeed");

    assert_eq!(meta.state, SessionState::Idle);
    assert_eq!(meta.agent, "writer-bot");
    assert_eq!(backend.ensure_calls(), 1);
}

#[tokio::test]
async fn initialize_session_rejects_a_non_absolute_cwd() {
    let (manager, _backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);

    let err = manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, Some("relative/path"), None)
        .await
        .expect_err("a relative cwd must be rejected");

    assert_eq!(err.acp_code(), Some(AcpErrorCode::InvalidRuntimeOption));
}

// ── runTurn ──────────────────────────────────────────────────────────

#[tokio::test]
async fn run_turn_streams_events_and_returns_the_session_to_idle() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("init");

    backend
        .push_script(vec![
            RuntimeEvent::TextDelta { text: "hello".to_owned() },
            RuntimeEvent::Done { stop_reason: Some("end_turn".to_owned()) },
        ])
        .await;

    let mut seen = Vec::new();
    manager
        .run_turn(&cfg, "agent:a:acp:1", "hi", TurnMode::Prompt, "req-1", None, &mut |event| seen.push(event.clone()))
        .await
        .expect("run_turn should succeed");

    assert_eq!(seen.len(), 2);
    let status = manager.get_session_status(&cfg, "agent:a:acp:1").await.expect("status");
    assert_eq!(status.state, SessionState::Idle);
}

#[tokio::test]
async fn run_turn_propagates_an_in_band_error_event_and_marks_the_session_errored() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("init");

    backend
        .push_script(vec![RuntimeEvent::Error {
            code: "ACP_TURN_FAILED".to_owned(),
            message: "backend blew up".to_owned(),
        }])
        .await;

    let err = manager
        .run_turn(&cfg, "agent:a:acp:1", "hi", TurnMode::Prompt, "req-1", None, &mut |_| {})
        .await
        .expect_err("an Error event should fail the turn");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::TurnFailed));

    let status = manager.get_session_status(&cfg, "agent:a:acp:1").await.expect("status");
    assert_eq!(status.state, SessionState::Error);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn run_turn_against_an_unknown_session_fails_with_session_init_failed() {
    let (manager, _backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);

    let err = manager
        .run_turn(&cfg, "agent:a:acp:not-initialized", "hi", TurnMode::Prompt, "req-1", None, &mut |_| {})
        .await
        .expect_err("a never-initialized session has no metadata");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::SessionInitFailed));
}

#[tokio::test]
async fn oneshot_sessions_close_their_handle_after_a_successful_turn() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Oneshot, None, None)
        .await
        .expect("init");

    manager
        .run_turn(&cfg, "agent:a:acp:1", "hi", TurnMode::Prompt, "req-1", None, &mut |_| {})
        .await
        .expect("run_turn should succeed");

    assert_eq!(backend.close_calls(), 1, "oneshot sessions close their handle once the turn completes");
}

// ── cancelSession ────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_session_against_an_idle_handle_invokes_the_backend_cancel() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("init");

    manager.cancel_session("agent:a:acp:1", "user-requested").await.expect("cancel should succeed");
    assert_eq!(backend.cancel_calls(), 1);
}

#[tokio::test]
async fn cancel_session_during_an_in_flight_turn_cancels_the_turn_and_calls_the_backend_once() {
    let (manager, backend) = manager_with_backend().await;
    let manager = Arc::new(manager);
    let cfg = test_acp_config(8);
    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("init");

    backend.set_wait_for_cancel(true).await;

    let turn_manager = Arc::clone(&manager);
    let turn_cfg = cfg.clone();
    let turn = tokio::spawn(async move {
        turn_manager
            .run_turn(&turn_cfg, "agent:a:acp:1", "hi", TurnMode::Prompt, "req-1", None, &mut |_| {})
            .await
    });

    // Give the spawned turn a moment to register its cancellation token
    // before `cancel_session` looks for one.
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.cancel_session("agent:a:acp:1", "user-requested").await.expect("cancel should succeed");

    let err = turn.await.expect("turn task should not panic").expect_err("a cancelled turn surfaces as an error");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::TurnFailed));
    assert_eq!(backend.cancel_calls(), 1);

    let status = manager.get_session_status(&cfg, "agent:a:acp:1").await.expect("status");
    assert_eq!(status.state, SessionState::Error);
}

#[tokio::test]
async fn cancel_session_with_no_cached_handle_is_a_no_op() {
    let (manager, backend) = manager_with_backend().await;
    manager.cancel_session("agent:a:acp:never-opened", "user-requested").await.expect("cancel on an absent handle is a no-op");
    assert_eq!(backend.cancel_calls(), 0);
}

// ── closeSession ─────────────────────────────────────────────────────

#[tokio::test]
async fn close_session_clears_the_cached_handle_and_optionally_the_metadata() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("init");

    let notice = manager
        .close_session(&cfg, "agent:a:acp:1", "test-close", true, false, false)
        .await
        .expect("close_session should succeed");
    assert_eq!(notice, None);
    assert_eq!(backend.close_calls(), 1);

    let resolved = manager.resolve_session("agent:a:acp:1").await.expect("resolve_session");
    assert!(matches!(resolved, openclaw_core::model::ResolvedSession::Stale));
}

#[tokio::test]
async fn close_session_with_require_acp_session_fails_when_nothing_is_open() {
    let (manager, _backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);

    let err = manager
        .close_session(&cfg, "agent:a:acp:never-opened", "test-close", false, false, true)
        .await
        .expect_err("requireAcpSession should surface a missing session as an error");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::SessionInitFailed));
}

#[tokio::test]
async fn close_session_without_require_acp_session_silently_succeeds_when_nothing_is_open() {
    let (manager, _backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);

    let notice = manager
        .close_session(&cfg, "agent:a:acp:never-opened", "test-close", false, false, false)
        .await
        .expect("absent sessions are a silent no-op without requireAcpSession");
    assert_eq!(notice, None);
}

#[tokio::test]
async fn close_session_tolerates_backend_unavailable_when_allowed() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("init");
    backend.fail_close_with(AcpErrorCode::BackendUnavailable).await;

    let notice = manager
        .close_session(&cfg, "agent:a:acp:1", "test-close", false, true, false)
        .await
        .expect("allowBackendUnavailable should swallow a BackendUnavailable close error");
    assert!(notice.is_some());
}
