// seam-client/tests/auth.rs
// 登录扩展集成测试

mod common;

use futures::FutureExt;
use serde_json::json;
use seam_client::{
    AuthExtension, AuthFailureKind, AuthStatus, AutoLogin, ClientError, Envelope, MemoryServer,
    PendingRequest,
};
use shared::message::{AUTH_ERROR, AUTH_LOGIN, AUTH_SUCCESS};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

async fn wait_for_status(auth: &AuthExtension, status: AuthStatus) {
    let mut changes = auth.status_changes();
    while auth.status() != status {
        changes.recv().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_login_releases_held_requests() {
    let server = MemoryServer::new();
    let session = common::connected(&server).await;
    let auth = AuthExtension::install(&session, None);
    assert_eq!(auth.status(), AuthStatus::LoggedOut);

    session
        .send(PendingRequest::new(Envelope::new("orders.sync", json!({})), true, true))
        .unwrap();

    let login = tokio::spawn({
        let auth = auth.clone();
        async move { auth.login(json!({"username": "ana", "password": "pw"})).await }
    });
    server.wait_for(|s| s.count(AUTH_LOGIN) == 1).await;
    assert_eq!(auth.status(), AuthStatus::LoggingIn);
    assert_eq!(server.count("orders.sync"), 0);

    server
        .latest()
        .unwrap()
        .deliver(&Envelope::new(AUTH_SUCCESS, json!({"userId": 7})));

    assert_eq!(login.await.unwrap().unwrap(), json!({"userId": 7}));
    assert!(auth.is_logged_in());
    assert!(session.is_authenticated());
    assert_eq!(auth.current_auth(), Some(json!({"userId": 7})));
    server.wait_for(|s| s.count("orders.sync") == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_login_error_is_reported() {
    let server = MemoryServer::new();
    let session = common::connected(&server).await;
    let auth = AuthExtension::install(&session, None);
    let mut failures = auth.auth_failures();

    let login = tokio::spawn({
        let auth = auth.clone();
        async move { auth.login(json!({"username": "ana", "password": "wrong"})).await }
    });
    server.wait_for(|s| s.count(AUTH_LOGIN) == 1).await;
    server
        .latest()
        .unwrap()
        .deliver(&Envelope::new(AUTH_ERROR, json!({"message": "Invalid credentials"})));

    let err = login.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Rpc(e) if e.error == "Invalid credentials"));
    assert_eq!(auth.status(), AuthStatus::LoggedOut);
    assert!(!session.is_authenticated());

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.kind, AuthFailureKind::Login);
    assert_eq!(failure.error.code, 401);
    assert_eq!(failure.error.error, "Invalid credentials");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_logs_out_and_auto_login_runs_again() {
    let server = MemoryServer::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let auto_login: AutoLogin = Arc::new({
        let attempts = attempts.clone();
        move || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Some(json!({"token": "saved"})) }.boxed()
        }
    });

    let session = common::session(&server);
    let auth = AuthExtension::install(&session, Some(auto_login));
    assert_eq!(auth.status(), AuthStatus::LoggingIn);
    session.connect().unwrap();

    server.wait_for(|s| s.count(AUTH_LOGIN) == 1).await;
    assert_eq!(server.frames_for(AUTH_LOGIN)[0].data, json!({"token": "saved"}));
    server
        .latest()
        .unwrap()
        .deliver(&Envelope::new(AUTH_SUCCESS, json!({"userId": 1})));
    wait_for_status(&auth, AuthStatus::LoggedIn).await;

    server.latest().unwrap().close(1006, "network lost");
    wait_for_status(&auth, AuthStatus::LoggedOut).await;
    assert!(auth.current_auth().is_none());

    common::reconnected(&server, &session, 2).await;
    server.wait_for(|s| s.count(AUTH_LOGIN) == 2).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_auto_login_times_out() {
    let server = MemoryServer::new();
    let auto_login: AutoLogin = Arc::new(|| async { Some(json!({"token": "saved"})) }.boxed());

    let session = common::session(&server);
    let auth = AuthExtension::install(&session, Some(auto_login));
    let mut failures = auth.auth_failures();
    session.connect().unwrap();

    server.wait_for(|s| s.count(AUTH_LOGIN) == 1).await;
    wait_for_status(&auth, AuthStatus::LoggedOut).await;
    assert!(!session.is_authenticated());

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.kind, AuthFailureKind::AutoLogin);
    assert!(failure.error.is_timeout());
}

#[tokio::test(start_paused = true)]
async fn test_declined_auto_login_stays_logged_out() {
    let server = MemoryServer::new();
    let auto_login: AutoLogin = Arc::new(|| async { None }.boxed());

    let session = common::session(&server);
    let auth = AuthExtension::install(&session, Some(auto_login));
    let mut failures = auth.auth_failures();
    session.connect().unwrap();
    session.await_connected().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(auth.status(), AuthStatus::LoggedOut);
    assert_eq!(server.count(AUTH_LOGIN), 0);

    let failure = failures.try_recv().unwrap();
    assert_eq!(failure.kind, AuthFailureKind::AutoLogin);
    assert_eq!(failure.error.code, 401);
}
