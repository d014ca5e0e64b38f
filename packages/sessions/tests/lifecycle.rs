// ABOUTME: Integration tests for session lifecycle transitions against the scripted provider
// ABOUTME: Covers ordering, conflicting transitions, failure paths, reconnect and recovery

use corral_sandbox::{HealthStatus, ScriptedProvider};
use corral_sessions::{CancelReason, SessionError, SessionRegistry, SessionState, SessionStorage};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

async fn setup() -> (Arc<SessionRegistry>, Arc<ScriptedProvider>, sqlx::SqlitePool) {
    let pool = corral_storage::connect_in_memory()
        .await
        .expect("Failed to create in-memory database");
    let provider = Arc::new(ScriptedProvider::new());
    let registry = Arc::new(SessionRegistry::new(
        SessionStorage::new(pool.clone()),
        provider.clone(),
    ));
    (registry, provider, pool)
}

#[tokio::test]
async fn test_start_passes_through_starting() {
    let (registry, provider, _pool) = setup().await;
    provider.set_provision_delay(Duration::from_millis(200));
    let session = registry.create().await.unwrap();

    let task = {
        let registry = registry.clone();
        let id = session.id.clone();
        tokio::spawn(async move { registry.start(&id).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        registry.get(&session.id).await.unwrap().state,
        SessionState::Starting
    );

    let started = task.await.unwrap().unwrap();
    assert_eq!(started.state, SessionState::Running);
    assert!(started.sandbox.is_some());
    assert_eq!(provider.provisioned().len(), 1);
}

#[tokio::test]
async fn test_concurrent_transition_is_rejected() {
    let (registry, provider, _pool) = setup().await;
    provider.set_provision_delay(Duration::from_millis(200));
    let session = registry.create().await.unwrap();

    let first = {
        let registry = registry.clone();
        let id = session.id.clone();
        tokio::spawn(async move { registry.start(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = registry.start(&session.id).await;
    assert!(matches!(second, Err(SessionError::ConflictingTransition(_))));
    let stop = registry.stop(&session.id).await;
    assert!(matches!(stop, Err(SessionError::ConflictingTransition(_))));

    first.await.unwrap().unwrap();
    assert_eq!(provider.provisioned().len(), 1);
}

#[tokio::test]
async fn test_provision_failure_leaves_session_in_error() {
    let (registry, provider, _pool) = setup().await;
    provider.fail_next_provision("no capacity");
    let session = registry.create().await.unwrap();

    let err = registry.start(&session.id).await.unwrap_err();
    assert!(matches!(err, SessionError::SandboxUnavailable(ref msg) if msg.contains("no capacity")));

    let session = registry.get(&session.id).await.unwrap();
    assert_eq!(session.state, SessionState::Error);
    assert!(session.sandbox.is_none());
    assert!(session.error_message.unwrap().contains("no capacity"));
}

#[tokio::test]
async fn test_unhealthy_fresh_sandbox_is_released() {
    let (registry, provider, _pool) = setup().await;
    provider.set_default_health(HealthStatus::Unhealthy);
    let session = registry.create().await.unwrap();

    let err = registry.start(&session.id).await.unwrap_err();
    assert!(matches!(err, SessionError::SandboxUnavailable(_)));
    assert_eq!(provider.terminated().len(), 1);
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test]
async fn test_unknown_health_is_accepted() {
    let (registry, provider, _pool) = setup().await;
    provider.set_default_health(HealthStatus::Unknown);
    let session = registry.create().await.unwrap();

    let session = registry.start(&session.id).await.unwrap();
    assert_eq!(session.state, SessionState::Running);
}

#[tokio::test]
async fn test_stop_releases_sandbox() {
    let (registry, provider, _pool) = setup().await;
    let session = registry.create().await.unwrap();
    registry.start(&session.id).await.unwrap();

    let stopped = registry.stop(&session.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert!(stopped.sandbox.is_none());
    assert_eq!(provider.live_count(), 0);

    // Stopped without a retained sandbox cannot reconnect, but can start again
    assert!(matches!(
        registry.reconnect(&session.id).await,
        Err(SessionError::InvalidTransition { .. })
    ));
    let restarted = registry.start(&session.id).await.unwrap();
    assert_eq!(restarted.state, SessionState::Running);
    assert_eq!(provider.provisioned().len(), 2);
}

#[tokio::test]
async fn test_stop_with_failed_terminate_retains_sandbox() {
    let (registry, provider, _pool) = setup().await;
    let session = registry.create().await.unwrap();
    let running = registry.start(&session.id).await.unwrap();
    let handle = running.sandbox.clone().unwrap();

    provider.set_terminate_failure(Some("daemon went away"));
    let stopped = registry.stop(&session.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert_eq!(stopped.sandbox, Some(handle.clone()));
    assert!(stopped.error_message.is_some());

    // Stopped-with-retained-sandbox re-attaches without provisioning
    provider.set_terminate_failure(None);
    let reconnected = registry.reconnect(&session.id).await.unwrap();
    assert_eq!(reconnected.state, SessionState::Running);
    assert_eq!(reconnected.sandbox, Some(handle));
    assert_eq!(provider.provisioned().len(), 1);
}

#[tokio::test]
async fn test_reconnect_from_error_reuses_reachable_sandbox() {
    let (registry, provider, _pool) = setup().await;
    let session = registry.create().await.unwrap();
    let running = registry.start(&session.id).await.unwrap();
    let handle = running.sandbox.clone().unwrap();

    assert!(registry
        .mark_unhealthy(&session.id, "health check timed out")
        .await
        .unwrap());
    assert_eq!(
        registry.get(&session.id).await.unwrap().state,
        SessionState::Error
    );

    let reconnected = registry.reconnect(&session.id).await.unwrap();
    assert_eq!(reconnected.state, SessionState::Running);
    assert_eq!(reconnected.sandbox, Some(handle));
    assert_eq!(reconnected.error_message, None);
    assert_eq!(provider.provisioned().len(), 1);
}

#[tokio::test]
async fn test_reconnect_falls_back_to_fresh_sandbox() {
    let (registry, provider, _pool) = setup().await;
    let session = registry.create().await.unwrap();
    let running = registry.start(&session.id).await.unwrap();
    let old = running.sandbox.clone().unwrap();

    registry.mark_unhealthy(&session.id, "gone").await.unwrap();
    provider.set_health(&old.id, HealthStatus::Unhealthy);

    let reconnected = registry.reconnect(&session.id).await.unwrap();
    assert_eq!(reconnected.state, SessionState::Running);
    assert_ne!(reconnected.sandbox.as_ref(), Some(&old));
    assert_eq!(provider.provisioned().len(), 2);
    assert!(provider.terminated().contains(&old.id));
}

#[tokio::test]
async fn test_reconnect_only_from_error_or_retained_stop() {
    let (registry, _provider, _pool) = setup().await;
    let session = registry.create().await.unwrap();
    assert!(matches!(
        registry.reconnect(&session.id).await,
        Err(SessionError::InvalidTransition {
            from: SessionState::Created,
            ..
        })
    ));

    registry.start(&session.id).await.unwrap();
    assert!(matches!(
        registry.reconnect(&session.id).await,
        Err(SessionError::InvalidTransition {
            from: SessionState::Running,
            ..
        })
    ));
}

#[tokio::test]
async fn test_stop_cancels_active_execution() {
    let (registry, _provider, _pool) = setup().await;
    let session = registry.create().await.unwrap();
    registry.start(&session.id).await.unwrap();

    let guard = registry.acquire_slot(&session.id, "exe_1").await.unwrap();
    let cancel = guard.cancel_signal();
    let holder = tokio::spawn(async move {
        let reason = cancel.cancelled().await;
        (reason, guard.release().await)
    });

    let stopped = registry.stop(&session.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert_eq!(holder.await.unwrap(), (CancelReason::SessionStopped, true));
    assert_eq!(registry.active_execution(&session.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_recover_moves_interrupted_sessions_to_error() {
    let (registry, provider, pool) = setup().await;
    let session = registry.create().await.unwrap();
    let running = registry.start(&session.id).await.unwrap();
    let idle = registry.create().await.unwrap();

    // A fresh registry over the same database stands in for a restart
    let restarted = SessionRegistry::new(SessionStorage::new(pool), provider.clone());
    assert_eq!(restarted.recover().await.unwrap(), 1);

    let recovered = restarted.get(&session.id).await.unwrap();
    assert_eq!(recovered.state, SessionState::Error);
    assert_eq!(recovered.sandbox, running.sandbox);
    assert_eq!(
        restarted.get(&idle.id).await.unwrap().state,
        SessionState::Created
    );

    let reconnected = restarted.reconnect(&session.id).await.unwrap();
    assert_eq!(reconnected.state, SessionState::Running);
    assert_eq!(provider.provisioned().len(), 1);
}

#[tokio::test]
async fn test_delete_stops_and_forgets_session() {
    let (registry, provider, _pool) = setup().await;
    let session = registry.create().await.unwrap();
    registry.start(&session.id).await.unwrap();

    registry.delete(&session.id).await.unwrap();
    assert_eq!(provider.live_count(), 0);
    assert!(matches!(
        registry.get(&session.id).await,
        Err(SessionError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_list_overlays_active_execution() {
    let (registry, _provider, _pool) = setup().await;
    for _ in 0..3 {
        registry.create().await.unwrap();
    }
    let busy = registry.create().await.unwrap();
    registry.start(&busy.id).await.unwrap();
    let guard = registry.acquire_slot(&busy.id, "exe_9").await.unwrap();

    let (sessions, total) = registry.list(10, 0).await.unwrap();
    assert_eq!(total, 4);
    let listed = sessions.iter().find(|s| s.id == busy.id).unwrap();
    assert_eq!(listed.current_execution_id.as_deref(), Some("exe_9"));
    guard.release().await;
}

#[tokio::test]
async fn test_cancel_reasons_reach_the_slot_holder() {
    let (registry, provider, _pool) = setup().await;
    let session = registry.create().await.unwrap();
    let session = registry.start(&session.id).await.unwrap();

    let guard = registry.acquire_slot(&session.id, "exe_1").await.unwrap();
    assert!(registry.cancel_execution(&session.id, "exe_1").await.unwrap());
    assert_eq!(guard.cancel_signal().reason(), Some(CancelReason::User));
    guard.release().await;

    let guard = registry.acquire_slot(&session.id, "exe_2").await.unwrap();
    provider.set_health(&session.sandbox.unwrap().id, HealthStatus::Unhealthy);
    assert!(registry
        .mark_unhealthy(&session.id, "sandbox failed health check")
        .await
        .unwrap());
    assert_eq!(
        guard.cancel_signal().reason(),
        Some(CancelReason::SandboxUnhealthy)
    );
    guard.release().await;
}

#[tokio::test]
async fn test_stop_if_idle_skips_busy_and_recent_sessions() {
    let (registry, provider, _pool) = setup().await;
    let session = registry.create().await.unwrap();
    registry.start(&session.id).await.unwrap();

    // Recently active
    assert!(!registry
        .stop_if_idle(&session.id, Duration::from_secs(60))
        .await
        .unwrap());

    let guard = registry.acquire_slot(&session.id, "exe_1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!registry
        .stop_if_idle(&session.id, Duration::from_millis(10))
        .await
        .unwrap());
    assert_eq!(guard.cancel_signal().reason(), None);
    guard.release().await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(registry
        .stop_if_idle(&session.id, Duration::from_millis(10))
        .await
        .unwrap());
    let stopped = registry.get(&session.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
    assert_eq!(provider.live_count(), 0);

    // Not Running any more
    assert!(!registry
        .stop_if_idle(&session.id, Duration::from_millis(10))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_idle_reclaim_never_cancels_an_accepted_execution() {
    let (registry, _provider, _pool) = setup().await;

    for yields in 0..20 {
        let session = registry.create().await.unwrap();
        registry.start(&session.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reclaim = {
            let registry = registry.clone();
            let id = session.id.clone();
            tokio::spawn(async move { registry.stop_if_idle(&id, Duration::from_millis(5)).await })
        };
        for _ in 0..yields {
            tokio::task::yield_now().await;
        }

        match registry.acquire_slot(&session.id, "exe_1").await {
            Ok(guard) => {
                assert!(!reclaim.await.unwrap().unwrap(), "round {yields}");
                assert_eq!(guard.cancel_signal().reason(), None, "round {yields}");
                assert_eq!(
                    registry.get(&session.id).await.unwrap().state,
                    SessionState::Running
                );
                guard.release().await;
            }
            Err(e) => {
                assert!(
                    matches!(e, SessionError::NotRunning { .. }),
                    "round {yields}: {e}"
                );
                assert!(reclaim.await.unwrap().unwrap(), "round {yields}");
            }
        }
    }
}

#[tokio::test]
async fn test_failed_state_write_leaves_session_usable() {
    let (registry, _provider, pool) = setup().await;
    let session = registry.create().await.unwrap();
    registry.start(&session.id).await.unwrap();

    sqlx::query(
        "CREATE TRIGGER reject_stopping BEFORE UPDATE ON sessions
         WHEN NEW.state = 'stopping'
         BEGIN SELECT RAISE(FAIL, 'write rejected'); END",
    )
    .execute(&pool)
    .await
    .unwrap();

    assert!(matches!(
        registry.stop(&session.id).await,
        Err(SessionError::Storage(_))
    ));
    assert_eq!(
        registry.get(&session.id).await.unwrap().state,
        SessionState::Running
    );
    // The in-memory side agrees with the record
    let guard = registry.acquire_slot(&session.id, "exe_1").await.unwrap();
    guard.release().await;

    sqlx::query("DROP TRIGGER reject_stopping")
        .execute(&pool)
        .await
        .unwrap();
    let stopped = registry.stop(&session.id).await.unwrap();
    assert_eq!(stopped.state, SessionState::Stopped);
}
