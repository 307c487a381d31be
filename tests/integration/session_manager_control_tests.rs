//! Runtime control surface: `setSessionRuntimeMode`, `setSessionConfigOption`,
//! `updateSessionRuntimeOptions`, `resetSessionRuntimeOptions`, and the
//! applied-control-signature reapply-skip optimization `runTurn` relies on.

use serde_json::json;

use openclaw_core::errors::AcpErrorCode;
use openclaw_core::model::{RuntimeCapabilities, RuntimeOptions, SessionMode, TurnMode};

use super::test_helpers::{manager_with_backend, test_acp_config};

async fn init(manager: &openclaw_core::session::manager::AcpSessionManager, cfg: &openclaw_core::config::AcpConfig) {
    manager
        .initialize_session(cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("init");
}

#[tokio::test]
async fn set_session_runtime_mode_is_rejected_when_the_backend_does_not_advertise_set_mode() {
    let (manager, _backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    init(&manager, &cfg).await;

    let err = manager
        .set_session_runtime_mode(&cfg, "agent:a:acp:1", "yolo")
        .await
        .expect_err("backend with no controls should reject setMode");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::UnsupportedControl));
}

#[tokio::test]
async fn set_session_runtime_mode_rejects_an_empty_mode_string() {
    let (manager, _backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    init(&manager, &cfg).await;

    let err = manager
        .set_session_runtime_mode(&cfg, "agent:a:acp:1", "   ")
        .await
        .expect_err("a blank mode must be rejected before touching the backend");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::InvalidRuntimeOption));
}

#[tokio::test]
async fn set_session_runtime_mode_applies_and_persists_when_supported() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    init(&manager, &cfg).await;
    backend
        .set_capabilities(RuntimeCapabilities {
            controls: vec!["setMode".to_owned()],
            config_option_keys: None,
        })
        .await;

    manager.set_session_runtime_mode(&cfg, "agent:a:acp:1", "yolo").await.expect("setMode should succeed");

    assert_eq!(backend.applied_modes().await, vec!["yolo".to_owned()]);
    let status = manager.get_session_status(&cfg, "agent:a:acp:1").await.expect("status");
    assert_eq!(status.runtime_options.runtime_mode.as_deref(), Some("yolo"));
}

#[tokio::test]
async fn set_session_config_option_rejects_a_key_outside_the_advertised_set() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    init(&manager, &cfg).await;
    backend
        .set_capabilities(RuntimeCapabilities {
            controls: vec!["setConfigOption".to_owned()],
            config_option_keys: Some(vec!["model".to_owned()]),
        })
        .await;

    let err = manager
        .set_session_config_option(&cfg, "agent:a:acp:1", "permissionProfile", &json!("strict"))
        .await
        .expect_err("a key outside config_option_keys must be rejected");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::UnsupportedControl));
}

#[tokio::test]
async fn set_session_config_option_rejects_an_invalid_timeout_value() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    init(&manager, &cfg).await;
    backend
        .set_capabilities(RuntimeCapabilities {
            controls: vec!["setConfigOption".to_owned()],
            config_option_keys: None,
        })
        .await;

    let err = manager
        .set_session_config_option(&cfg, "agent:a:acp:1", "timeoutSeconds", &json!(0))
        .await
        .expect_err("timeoutSeconds = 0 must fail validation");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::InvalidRuntimeOption));
}

#[tokio::test]
async fn run_turn_skips_reapplying_unchanged_runtime_options_on_the_second_call() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    init(&manager, &cfg).await;
    backend
        .set_capabilities(RuntimeCapabilities {
            controls: vec!["setMode".to_owned()],
            config_option_keys: None,
        })
        .await;
    manager.set_session_runtime_mode(&cfg, "agent:a:acp:1", "yolo").await.expect("setMode should succeed");
    assert_eq!(backend.applied_modes().await.len(), 1, "setSessionRuntimeMode itself applies once");

    manager
        .run_turn(&cfg, "agent:a:acp:1", "turn one", TurnMode::Prompt, "req-1", None, &mut |_| {})
        .await
        .expect("first run_turn");
    manager
        .run_turn(&cfg, "agent:a:acp:1", "turn two", TurnMode::Prompt, "req-2", None, &mut |_| {})
        .await
        .expect("second run_turn");

    assert_eq!(
        backend.applied_modes().await.len(),
        2,
        "runTurn reapplies controls exactly once after they change, then the signature matches and it skips"
    );
}

#[tokio::test]
async fn update_session_runtime_options_with_a_cwd_change_invalidates_the_cached_handle() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    init(&manager, &cfg).await;

    manager
        .update_session_runtime_options("agent:a:acp:1", RuntimeOptions {
            cwd: Some("/tmp/new-workspace".to_owned()),
            ..RuntimeOptions::default()
        })
        .await
        .expect("cwd update should succeed");

    manager
        .run_turn(&cfg, "agent:a:acp:1", "hi", TurnMode::Prompt, "req-1", None, &mut |_| {})
        .await
        .expect("run_turn after a cwd change should re-ensure a handle");

    assert_eq!(backend.ensure_calls(), 2, "a cwd change must force a fresh ensureSession call");
}

#[tokio::test]
async fn update_session_runtime_options_rejects_a_non_absolute_cwd() {
    let (manager, _backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    init(&manager, &cfg).await;

    let err = manager
        .update_session_runtime_options("agent:a:acp:1", RuntimeOptions {
            cwd: Some("relative".to_owned()),
            ..RuntimeOptions::default()
        })
        .await
        .expect_err("a relative cwd patch must be rejected");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::InvalidRuntimeOption));
}

#[tokio::test]
async fn reset_session_runtime_options_closes_the_handle_and_clears_persisted_options() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(8);
    init(&manager, &cfg).await;
    manager
        .update_session_runtime_options("agent:a:acp:1", RuntimeOptions {
            model: Some("opus".to_owned()),
            ..RuntimeOptions::default()
        })
        .await
        .expect("set a runtime option");

    manager.reset_session_runtime_options(&cfg, "agent:a:acp:1").await.expect("reset should succeed");

    assert_eq!(backend.close_calls(), 1);
    let status = manager.get_session_status(&cfg, "agent:a:acp:1").await.expect("status");
    assert_eq!(status.runtime_options.model, None);
}
