mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use dine_session::prelude::*;
use dine_session_auth::AuthApiError;

async fn signed_in(api: &std::sync::Arc<FakeAuthApi>, options: ClientOptions) -> DineSession {
    let session = session_with(api, options);
    session.lifecycle().boot().await;
    session
        .lifecycle()
        .login(LoginCredentials::new("manager@example.com", "secret"))
        .await
        .unwrap();
    session
}

#[tokio::test]
async fn test_boot_without_session() {
    let api = FakeAuthApi::new();
    let session = session_with(&api, options());
    assert!(session.lifecycle().is_loading());

    let phase = session.lifecycle().boot().await;

    assert_eq!(phase, SessionPhase::Unauthenticated);
    assert!(!session.lifecycle().is_loading());
    assert!(session.lifecycle().current_user().is_none());
    assert_eq!(api.me_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_boot_verifies_valid_session() {
    let api = FakeAuthApi::new();
    let session = session_with(&api, options());
    session
        .store()
        .set_session(record(fresh_access(), fresh_refresh()));

    let phase = session.lifecycle().boot().await;

    assert_eq!(phase, SessionPhase::Authenticated);
    assert_eq!(api.me_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.refresh_count(), 0);
    assert_eq!(session.lifecycle().current_user(), Some(user()));
}

#[tokio::test]
async fn test_boot_without_verification_trusts_store() {
    let api = FakeAuthApi::new();
    let session = session_with(&api, options().with_verify_on_boot(false));
    session
        .store()
        .set_session(record(fresh_access(), fresh_refresh()));

    assert_eq!(session.lifecycle().boot().await, SessionPhase::Authenticated);
    assert_eq!(api.me_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_boot_refreshes_expired_access_token() {
    let api = FakeAuthApi::new();
    let session = session_with(&api, options());
    session
        .store()
        .set_session(record(expired_access(), fresh_refresh()));

    let phase = session.lifecycle().boot().await;

    assert_eq!(phase, SessionPhase::Authenticated);
    assert_eq!(api.refresh_count(), 1);
    assert_eq!(session.store().access_token(), api.issued().first().cloned());
}

#[tokio::test]
async fn test_boot_refreshes_when_server_refuses_token() {
    let api = FakeAuthApi::new();
    let session = session_with(&api, options());
    let revoked = fresh_access();
    api.revoke(&revoked);
    session.store().set_session(record(revoked, fresh_refresh()));

    let phase = session.lifecycle().boot().await;

    assert_eq!(phase, SessionPhase::Authenticated);
    assert_eq!(api.refresh_count(), 1);
    assert_eq!(api.me_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_boot_with_rejected_refresh_clears_session() {
    let api = FakeAuthApi::new();
    api.set_behavior(RefreshBehavior::Reject);
    let session = session_with(&api, options());
    session
        .store()
        .set_session(record(expired_access(), fresh_refresh()));

    let phase = session.lifecycle().boot().await;

    assert_eq!(phase, SessionPhase::Unauthenticated);
    assert!(!session.store().has_session());
}

#[tokio::test]
async fn test_boot_only_runs_once() {
    let api = FakeAuthApi::new();
    let session = signed_in(&api, options()).await;

    assert_eq!(session.lifecycle().boot().await, SessionPhase::Authenticated);
    assert_eq!(api.me_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_boot_restores_persisted_session() {
    let dir = tempfile::tempdir().unwrap();
    let options = ClientOptions::new("http://127.0.0.1:9/api")
        .with_storage_path(dir.path().join("session.json"))
        .with_verify_on_boot(false);

    let first = DineSession::new(options.clone()).unwrap();
    first
        .store()
        .set_session(record(fresh_access(), fresh_refresh()));

    let second = DineSession::new(options).unwrap();
    assert_eq!(second.lifecycle().boot().await, SessionPhase::Authenticated);
    assert_eq!(second.store().snapshot(), first.store().snapshot());
}

#[tokio::test]
async fn test_login_and_logout() {
    let api = FakeAuthApi::new();
    let session = session_with(&api, options());
    session.lifecycle().boot().await;
    let mut phase = session.lifecycle().subscribe();

    let user = session
        .lifecycle()
        .login(LoginCredentials::new("manager@example.com", "secret"))
        .await
        .unwrap();

    assert_eq!(user.role, Role::Manager);
    assert!(session.lifecycle().is_authenticated());
    assert!(session.store().has_session());
    phase.changed().await.unwrap();
    assert_eq!(*phase.borrow_and_update(), SessionPhase::Authenticated);

    session.lifecycle().logout().await;

    assert_eq!(api.logout_calls.load(Ordering::SeqCst), 1);
    assert!(!session.lifecycle().is_authenticated());
    assert!(!session.store().has_session());
    phase.changed().await.unwrap();
    assert_eq!(*phase.borrow_and_update(), SessionPhase::Unauthenticated);
}

#[tokio::test]
async fn test_failed_login_changes_nothing() {
    let api = FakeAuthApi::new();
    let session = session_with(&api, options());
    session.lifecycle().boot().await;

    let err = session
        .lifecycle()
        .login(LoginCredentials::new("manager@example.com", "wrong"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::AuthApi(AuthApiError::Rejected { status: 401, .. })
    ));
    assert_eq!(session.lifecycle().phase(), SessionPhase::Unauthenticated);
    assert!(!session.store().has_session());
}

#[tokio::test]
async fn test_logout_clears_even_when_server_fails() {
    let api = FakeAuthApi::new();
    let session = signed_in(&api, options()).await;
    api.set_logout_fails(true);

    session.lifecycle().logout().await;

    assert_eq!(api.logout_calls.load(Ordering::SeqCst), 1);
    assert!(!session.store().has_session());
    assert_eq!(session.lifecycle().phase(), SessionPhase::Unauthenticated);
}

#[tokio::test]
async fn test_role_gating() {
    let api = FakeAuthApi::new();
    let session = session_with(&api, options());
    assert!(!session.lifecycle().has_role(&[Role::Manager]));

    session.lifecycle().boot().await;
    session
        .lifecycle()
        .login(LoginCredentials::new("manager@example.com", "secret"))
        .await
        .unwrap();

    assert!(session.lifecycle().has_role(&[Role::Manager]));
    assert!(session.lifecycle().has_role(&[Role::Admin, Role::Manager]));
    assert!(!session.lifecycle().has_role(&[Role::Admin]));
    assert!(!session.lifecycle().has_role(&[]));

    session.lifecycle().logout().await;
    assert!(!session.lifecycle().has_role(&[Role::Manager]));
}

#[tokio::test]
async fn test_refresh_if_needed() {
    let api = FakeAuthApi::new();
    let session = session_with(&api, options());
    session.lifecycle().boot().await;
    assert!(!session.lifecycle().refresh_if_needed().await);

    session
        .lifecycle()
        .login(LoginCredentials::new("manager@example.com", "secret"))
        .await
        .unwrap();
    assert!(!session.lifecycle().refresh_if_needed().await);
    assert_eq!(api.refresh_count(), 0);

    session
        .store()
        .set_session(record(expired_access(), fresh_refresh()));
    assert!(session.lifecycle().refresh_if_needed().await);
    assert_eq!(api.refresh_count(), 1);
}

#[tokio::test]
async fn test_refresh_if_needed_honours_skew() {
    let api = FakeAuthApi::new();
    let options = options().with_expiry_skew(Duration::from_secs(120));
    let session = signed_in(&api, options).await;

    // Valid for another 90 seconds, inside the skew window.
    session
        .store()
        .set_session(record(mint_token("access", 90), fresh_refresh()));

    assert!(session.lifecycle().refresh_if_needed().await);
    assert_eq!(api.refresh_count(), 1);
}

#[tokio::test]
async fn test_refresh_timer() {
    let api = FakeAuthApi::new();
    let options = options().with_refresh_interval(Duration::from_millis(20));
    let session = signed_in(&api, options).await;
    session
        .store()
        .set_session(record(expired_access(), fresh_refresh()));

    let timer = session.lifecycle().spawn_refresh_timer();
    assert!(timer.is_running());
    wait_until(|| api.refresh_count() == 1).await;

    // The new token is fresh, so later ticks leave it alone.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.refresh_count(), 1);

    timer.stop().await;
    assert_eq!(session.store().access_token(), api.issued().first().cloned());
}

#[tokio::test]
async fn test_refresh_timer_idle_when_signed_out() {
    let api = FakeAuthApi::new();
    let options = options().with_refresh_interval(Duration::from_millis(10));
    let session = session_with(&api, options);
    session.lifecycle().boot().await;

    let timer = session.lifecycle().spawn_refresh_timer();
    tokio::time::sleep(Duration::from_millis(60)).await;
    drop(timer);

    assert_eq!(api.refresh_count(), 0);
}

#[tokio::test]
async fn test_timer_and_request_path_share_one_refresh() {
    let api = FakeAuthApi::new();
    let options = options().with_refresh_interval(Duration::from_secs(3600));
    let session = signed_in(&api, options).await;
    let stale = expired_access();
    session
        .store()
        .set_session(record(stale.clone(), fresh_refresh()));

    api.close_gate();
    let timer = session.lifecycle().spawn_refresh_timer();
    wait_until(|| api.refresh_count() == 1).await;

    // A request that just got a 401 with the stale token.
    let coordinator = session.coordinator().clone();
    let request_path = tokio::spawn(async move { coordinator.refresh_after(&stale).await });
    wait_until(|| session.coordinator().pending_waiters() == 2).await;

    api.open_gate();
    let token = request_path.await.unwrap().unwrap();

    assert_eq!(api.refresh_count(), 1);
    assert_eq!(api.issued(), vec![token]);
    timer.stop().await;
}
