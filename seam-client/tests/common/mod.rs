// seam-client/tests/common/mod.rs
// 集成测试共用的会话构造

#![allow(dead_code)]

use seam_client::{AuthGate, AuthStatus, MemoryServer, Session, SessionConfig, TransportKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const BASE_URL: &str = "mem://seam.test";

pub fn config() -> SessionConfig {
    SessionConfig::new(BASE_URL)
}

/// Session wired to `server` for both transport kinds
pub fn session_with(server: &MemoryServer, config: SessionConfig) -> Session {
    Session::builder(config)
        .connector(Arc::new(server.connector(TransportKind::Socket)))
        .connector(Arc::new(server.connector(TransportKind::Http)))
        .probe(Arc::new(server.clone()))
        .build()
        .unwrap()
}

pub fn session(server: &MemoryServer) -> Session {
    session_with(server, config())
}

/// Session that stays `connecting` until the test opens the link
pub fn held_session(server: &MemoryServer) -> Session {
    server.set_auto_open(false);
    session_with(server, config().with_connect_timeout(Duration::ZERO))
}

pub async fn connected(server: &MemoryServer) -> Session {
    let session = session(server);
    session.connect().unwrap();
    session.await_connected().await.unwrap();
    session
}

/// Gate flipped by the test
#[derive(Debug, Default)]
pub struct ToggleGate {
    logged_in: AtomicBool,
}

impl ToggleGate {
    pub fn logged_in() -> Arc<Self> {
        let gate = Arc::new(Self::default());
        gate.set(true);
        gate
    }

    pub fn set(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }
}

impl AuthGate for ToggleGate {
    fn status(&self) -> AuthStatus {
        if self.logged_in.load(Ordering::SeqCst) {
            AuthStatus::LoggedIn
        } else {
            AuthStatus::LoggedOut
        }
    }
}

/// Wait for a fresh link from the server and for the session to report
/// connected on it
pub async fn reconnected(server: &MemoryServer, session: &Session, connections: usize) {
    server.wait_for(|s| s.connection_count() >= connections).await;
    session.await_connected().await.unwrap();
}
