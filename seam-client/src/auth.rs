//! Auth gate and login extension
//!
//! The outbox only needs one question answered: is the session logged in?
//! [`AuthGate`] is that question. [`AuthExtension`] is the stock answer:
//! it drives `AUTH_LOGIN` / `AUTH_SUCCESS` / `AUTH_ERROR`, logs out when
//! the connection drops, and optionally logs back in on every reconnect.

use futures::future::BoxFuture;
use serde_json::Value;
use shared::message::{AUTH_ERROR, AUTH_LOGIN, AUTH_SUCCESS};
use shared::{Envelope, RpcError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, ClientResult};
use crate::outbox::PendingRequest;
use crate::router::RouteHandle;
use crate::session::{Session, SessionInner};
use crate::types::{StatusChange, TransportStatus};
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    LoggedIn,
    LoggingIn,
    LoggedOut,
}

/// Login state consulted by the outbox flush
pub trait AuthGate: Send + Sync {
    fn status(&self) -> AuthStatus;
}

/// Produces login params for an automatic login, or `None` to skip
pub type AutoLogin = Arc<dyn Fn() -> BoxFuture<'static, Option<Value>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureKind {
    /// `AuthExtension::login` was rejected or could not be sent
    Login,
    /// An automatic login was declined, rejected or timed out
    AutoLogin,
}

/// Failed login, as seen by [`AuthExtension::auth_failures`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    pub kind: AuthFailureKind,
    pub error: RpcError,
}

const AUTH_STATUS_CAPACITY: usize = 32;

struct AuthInner {
    session: Weak<SessionInner>,
    status: Mutex<AuthStatus>,
    current_auth: Mutex<Option<Value>>,
    status_tx: broadcast::Sender<AuthStatus>,
    failure_tx: broadcast::Sender<AuthFailure>,
    auto_login: Option<AutoLogin>,
    login_timeout: Duration,
    attempting_auto_login: AtomicBool,
    cancel: CancellationToken,
}

impl AuthGate for AuthInner {
    fn status(&self) -> AuthStatus {
        *lock(&self.status)
    }
}

#[derive(Clone)]
pub struct AuthExtension {
    inner: Arc<AuthInner>,
}

impl std::fmt::Debug for AuthExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthExtension")
            .field("status", &self.status())
            .field("auto_login", &self.inner.auto_login.is_some())
            .finish()
    }
}

impl AuthExtension {
    /// Install on `session` as its auth gate
    pub fn install(session: &Session, auto_login: Option<AutoLogin>) -> Self {
        let initial = if auto_login.is_some() {
            AuthStatus::LoggingIn
        } else {
            AuthStatus::LoggedOut
        };
        let (status_tx, _) = broadcast::channel(AUTH_STATUS_CAPACITY);
        let (failure_tx, _) = broadcast::channel(AUTH_STATUS_CAPACITY);
        let inner = Arc::new(AuthInner {
            session: Arc::downgrade(&session.inner),
            status: Mutex::new(initial),
            current_auth: Mutex::new(None),
            status_tx,
            failure_tx,
            auto_login,
            login_timeout: session.config().login_timeout,
            attempting_auto_login: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        session.set_auth_gate(inner.clone());

        let status_rx = session.status_changes();
        let success = session.inner.router.subscribe(AUTH_SUCCESS, false);
        let shutdown = session.inner.shutdown_token();
        tokio::spawn(inner.clone().run(status_rx, success, shutdown));

        if session.is_connected() {
            inner.attempt_auto_login();
        }
        Self { inner }
    }

    pub fn status(&self) -> AuthStatus {
        self.inner.status()
    }

    pub fn is_logged_in(&self) -> bool {
        self.status() == AuthStatus::LoggedIn
    }

    pub fn current_auth(&self) -> Option<Value> {
        lock(&self.inner.current_auth).clone()
    }

    pub fn status_changes(&self) -> broadcast::Receiver<AuthStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Failed explicit and automatic logins
    pub fn auth_failures(&self) -> broadcast::Receiver<AuthFailure> {
        self.inner.failure_tx.subscribe()
    }

    /// Send `AUTH_LOGIN` and wait for the server's verdict
    pub async fn login(&self, params: Value) -> ClientResult<Value> {
        let outcome = self.inner.login(params).await;
        if let Err(e) = &outcome {
            self.inner.report_failure(AuthFailureKind::Login, failure_error(e));
        }
        outcome
    }

    pub fn logout(&self) {
        self.inner.logout();
    }

    /// Stop reacting to status changes and login events
    pub fn uninstall(&self) {
        self.inner.cancel.cancel();
    }
}

impl AuthInner {
    fn session(&self) -> ClientResult<Arc<SessionInner>> {
        self.session.upgrade().ok_or(ClientError::Closed)
    }

    fn set_status(&self, status: AuthStatus) {
        {
            let mut current = lock(&self.status);
            if *current == status {
                return;
            }
            *current = status;
        }
        tracing::debug!(status = ?status, "Auth status updated");
        let _ = self.status_tx.send(status);
    }

    fn report_failure(&self, kind: AuthFailureKind, error: RpcError) {
        let _ = self.failure_tx.send(AuthFailure { kind, error });
    }

    fn logout(&self) {
        *lock(&self.current_auth) = None;
        self.set_status(AuthStatus::LoggedOut);
    }

    fn handle_login_event(&self, auth: Value) {
        *lock(&self.current_auth) = Some(auth);
        self.set_status(AuthStatus::LoggedIn);
        if let Some(session) = self.session.upgrade() {
            session.request_flush();
        }
    }

    async fn login(&self, params: Value) -> ClientResult<Value> {
        let session = self.session()?;
        self.set_status(AuthStatus::LoggingIn);

        // A login queued while offline would be purged on reconnect
        if let Err(e) = session.await_connected().await {
            self.set_status(AuthStatus::LoggedOut);
            return Err(e);
        }

        let mut success = session.router.subscribe(AUTH_SUCCESS, true);
        let mut failure = session.router.subscribe(AUTH_ERROR, true);
        let sent = session.send(PendingRequest::new(
            Envelope::new(AUTH_LOGIN, params),
            false,
            false,
        ));

        let outcome = match sent {
            Ok(()) => tokio::select! {
                data = success.rx.recv() => Ok(data.unwrap_or(Value::Null)),
                data = failure.rx.recv() => Err(auth_error(data.unwrap_or(Value::Null))),
                _ = self.cancel.cancelled() => Err(ClientError::Closed),
            },
            Err(e) => Err(e),
        };
        session.router.unsubscribe(&success.event, success.id);
        session.router.unsubscribe(&failure.event, failure.id);

        match outcome {
            Ok(auth) => {
                tracing::info!("Login succeeded");
                self.handle_login_event(auth.clone());
                Ok(auth)
            }
            Err(e) => {
                tracing::warn!("Login failed: {}", e);
                self.set_status(AuthStatus::LoggedOut);
                Err(e)
            }
        }
    }

    fn attempt_auto_login(self: &Arc<Self>) {
        let Some(auto_login) = self.auto_login.clone() else {
            tracing::debug!("No auto-login function set");
            return;
        };
        if self.attempting_auto_login.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            tracing::debug!("Attempting auto-login");
            let attempt = async {
                match auto_login().await {
                    Some(params) => this.login(params).await.map(Some),
                    None => Ok(None),
                }
            };
            let outcome = if this.login_timeout.is_zero() {
                Ok(attempt.await)
            } else {
                tokio::time::timeout(this.login_timeout, attempt).await
            };

            match outcome {
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) => {
                    tracing::debug!("Auto-login declined");
                    this.report_failure(
                        AuthFailureKind::AutoLogin,
                        RpcError::new(401, "Auto-login returned no credentials"),
                    );
                    this.logout();
                }
                Ok(Err(e)) => {
                    tracing::warn!("Auto-login failed: {}", e);
                    this.report_failure(AuthFailureKind::AutoLogin, failure_error(&e));
                    this.logout();
                }
                Err(_) => {
                    tracing::warn!(timeout = ?this.login_timeout, "Auto-login timed out");
                    this.report_failure(AuthFailureKind::AutoLogin, RpcError::timeout("auto-login"));
                    this.logout();
                }
            }
            this.attempting_auto_login.store(false, Ordering::Release);
        });
    }

    async fn run(
        self: Arc<Self>,
        mut status_rx: broadcast::Receiver<StatusChange>,
        mut success: RouteHandle,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,

                change = status_rx.recv() => match change {
                    Ok(change) if change.status == TransportStatus::Connected => {
                        self.attempt_auto_login();
                    }
                    Ok(_) => self.logout(),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },

                data = success.rx.recv() => match data {
                    Some(auth) => self.handle_login_event(auth),
                    None => break,
                },
            }
        }

        if let Some(session) = self.session.upgrade() {
            session.router.unsubscribe(&success.event, success.id);
        }
    }
}

fn auth_error(data: Value) -> ClientError {
    let error = RpcError::from_value(&data).unwrap_or_else(|| {
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Authentication failed");
        RpcError::new(401, message)
    });
    ClientError::Rpc(error)
}

fn failure_error(error: &ClientError) -> RpcError {
    match error {
        ClientError::Rpc(e) => e.clone(),
        ClientError::Closed | ClientError::NotConnected => RpcError::connection_interrupted(),
        other => RpcError::new(500, other.to_string()),
    }
}
