//! Admission control: `maxConcurrentSessions` caps the number of cached
//! runtime handles, and idle eviction reclaims slots for stale handles.

use openclaw_core::errors::AcpErrorCode;
use openclaw_core::model::SessionMode;

use super::test_helpers::{manager_with_backend, test_acp_config};

#[tokio::test]
async fn initialize_session_rejects_once_the_concurrent_session_cap_is_reached() {
    let (manager, _backend) = manager_with_backend().await;
    let cfg = test_acp_config(1);

    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("first session should fit under the cap");

    let err = manager
        .initialize_session(&cfg, "agent:a:acp:2", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect_err("a second distinct session should be rejected once the cap is reached");
    assert_eq!(err.acp_code(), Some(AcpErrorCode::SessionInitFailed));
}

#[tokio::test]
async fn re_initializing_the_same_session_key_ensures_a_fresh_handle_each_time() {
    let (manager, backend) = manager_with_backend().await;
    let cfg = test_acp_config(2);

    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("first init");
    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("re-initializing the same session key should not be blocked by its own cached handle");

    assert_eq!(backend.ensure_calls(), 2, "each initializeSession call ensures a fresh handle");
}

#[tokio::test]
async fn evicting_an_idle_handle_frees_a_slot_for_a_new_session() {
    let (manager, backend) = manager_with_backend().await;
    let mut cfg = test_acp_config(1);
    // An effectively-zero TTL means the very next eviction sweep treats
    // every cached handle as idle.
    cfg.runtime.ttl_minutes = 0.0;

    manager
        .initialize_session(&cfg, "agent:a:acp:1", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("first session should fit under the cap");

    // initialize_session's own eviction sweep (run before admission is
    // checked) should reclaim the first handle, making room for the second.
    manager
        .initialize_session(&cfg, "agent:a:acp:2", "writer-bot", SessionMode::Persistent, None, None)
        .await
        .expect("idle eviction should free a slot for the second session");

    assert_eq!(backend.close_calls(), 1, "the idle-evicted handle should have been closed");
}
