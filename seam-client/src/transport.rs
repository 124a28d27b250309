//! Transport - one physical connection and its lifecycle
//!
//! ```text
//!                connect()
//!  Disconnected ───────────► Connecting ──── Open ────► Connected
//!       ▲                        │                         │
//!       │   attempt timeout /    │   error / close /       │
//!       └──── link error ────────┴── stability failure ────┘
//!                                          │
//!                          failures > threshold on socket?
//!                            ├─ yes ─► session switches to HTTP
//!                            └─ no ──► probe until reachable, connect()
//! ```
//!
//! Every connection attempt bumps `epoch`. Link events, timers and the
//! stability checker all carry the epoch they were started under and do
//! nothing once it is stale, so a torn-down link can never touch the
//! current connection. `terminate()` makes the instance permanently inert.

use chrono::{DateTime, Utc};
use shared::{Envelope, RpcError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{ClientError, ClientResult};
use crate::link::{Connector, Link, LinkEvent, Probe};
use crate::session::SessionInner;
use crate::types::{TransportKind, TransportStatus};
use crate::util::{lock, sleep_or_forever};

/// Close code for a detected connection failure
pub const CONNECTION_FAILURE_CODE: u16 = 3900;
/// Close code for a terminated (superseded) transport
pub const TERMINATION_CODE: u16 = 3901;

struct TransportState {
    status: TransportStatus,
    epoch: u64,
    link: Option<Arc<dyn Link>>,
    failure_count: u32,
    last_inbound: Instant,
    connected_at: Option<DateTime<Utc>>,
    reconnect_started: Option<Instant>,
    attempt: Option<CancellationToken>,
    stability: Option<CancellationToken>,
    /// Cancelled when the current link is torn down; aborts in-flight sends
    connection: Option<CancellationToken>,
}

pub struct Transport {
    id: Uuid,
    kind: TransportKind,
    base_url: String,
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    probe: Arc<dyn Probe>,
    session: Weak<SessionInner>,
    state: Mutex<TransportState>,
    terminated: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.state);
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &st.status)
            .field("epoch", &st.epoch)
            .field("failure_count", &st.failure_count)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Transport {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        probe: Arc<dyn Probe>,
        config: Arc<SessionConfig>,
        session: Weak<SessionInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            kind: connector.kind(),
            base_url: config.base_url.clone(),
            config,
            connector,
            probe,
            session,
            state: Mutex::new(TransportState {
                status: TransportStatus::Disconnected,
                epoch: 0,
                link: None,
                failure_count: 0,
                last_inbound: Instant::now(),
                connected_at: None,
                reconnect_started: None,
                attempt: None,
                stability: None,
                connection: None,
            }),
            terminated: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn status(&self) -> TransportStatus {
        lock(&self.state).status
    }

    pub fn failure_count(&self) -> u32 {
        lock(&self.state).failure_count
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).connected_at
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Current connection attempt; bumped on every connect and disconnect
    pub(crate) fn epoch(&self) -> u64 {
        lock(&self.state).epoch
    }

    /// Apply a status change if `epoch` is still current. `before` runs
    /// after the check and before the new status becomes visible.
    pub(crate) fn transition(
        &self,
        epoch: u64,
        status: TransportStatus,
        before: impl FnOnce(),
    ) -> bool {
        let mut st = lock(&self.state);
        if st.epoch != epoch || st.status == status {
            return false;
        }
        before();
        st.status = status;
        true
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open a new link. Fails fast if a link already exists.
    pub fn connect(self: &Arc<Self>) -> ClientResult<()> {
        if self.is_terminated() {
            return Err(ClientError::InvalidState(format!(
                "transport {} is terminated",
                self.id
            )));
        }
        let session = self.session.upgrade().ok_or(ClientError::Closed)?;

        let epoch = {
            let mut st = lock(&self.state);
            if st.link.is_some() {
                return Err(ClientError::InvalidState(
                    "connect() called while a link is open".to_string(),
                ));
            }
            st.epoch += 1;
            st.epoch
        };

        let (link, events) = self.connector.open(&self.base_url)?;
        let attempt = CancellationToken::new();
        {
            let mut st = lock(&self.state);
            if st.epoch != epoch || self.is_terminated() {
                drop(st);
                link.close(TERMINATION_CODE, "superseded");
                return Ok(());
            }
            st.link = Some(link);
            st.attempt = Some(attempt.clone());
            st.connection = Some(CancellationToken::new());
            st.reconnect_started = None;
        }

        tracing::info!(transport_id = %self.id, kind = %self.kind, epoch, "Connecting");
        session.commit_status(self, epoch, TransportStatus::Connecting);

        tokio::spawn(self.clone().run_events(epoch, events));

        let this = self.clone();
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = attempt.cancelled() => {}
                _ = sleep_or_forever(timeout) => {
                    this.handle_connection_failure(epoch, "connection attempt timed out");
                }
            }
        });

        Ok(())
    }

    /// Tear down the current link from any state and fail every active
    /// call with a connection-interrupted error.
    pub fn disconnect(&self, code: u16, reason: &str) {
        let (link, epoch) = {
            let mut st = lock(&self.state);
            if let Some(t) = st.attempt.take() {
                t.cancel();
            }
            if let Some(t) = st.stability.take() {
                t.cancel();
            }
            if let Some(t) = st.connection.take() {
                t.cancel();
            }
            let Some(link) = st.link.take() else {
                return;
            };
            st.epoch += 1;
            st.connected_at = None;
            (link, st.epoch)
        };

        tracing::info!(
            transport_id = %self.id,
            kind = %self.kind,
            code,
            reason,
            "Disconnecting"
        );
        link.close(code, reason);

        if let Some(session) = self.session.upgrade() {
            if session.is_active(self.id) {
                let failed = session.fail_active_calls(RpcError::connection_interrupted());
                if failed > 0 {
                    tracing::info!(count = failed, "Failed in-flight calls on disconnect");
                }
            }
            session.commit_status(self, epoch, TransportStatus::Disconnected);
        }
    }

    /// Disconnect and go permanently inert. Idempotent.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(transport_id = %self.id, kind = %self.kind, "Terminating transport");
        self.shutdown.cancel();
        self.disconnect(TERMINATION_CODE, "terminated");
    }

    /// Send a text frame on the open link. Gives up with `NotConnected`
    /// as soon as the link is torn down, even if the send itself hangs.
    pub async fn send(&self, text: String) -> ClientResult<()> {
        let (link, connection) = {
            let st = lock(&self.state);
            if st.status != TransportStatus::Connected {
                return Err(ClientError::NotConnected);
            }
            match (st.link.clone(), st.connection.clone()) {
                (Some(link), Some(connection)) => (link, connection),
                _ => return Err(ClientError::NotConnected),
            }
        };
        tokio::select! {
            _ = connection.cancelled() => Err(ClientError::NotConnected),
            result = link.send(text) => result,
        }
    }

    // ========================================================================
    // Link events
    // ========================================================================

    fn is_stale(&self, epoch: u64) -> bool {
        self.is_terminated() || lock(&self.state).epoch != epoch
    }

    async fn run_events(
        self: Arc<Self>,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if self.is_stale(epoch) {
                tracing::debug!(transport_id = %self.id, epoch, "Ignoring event from superseded link");
                return;
            }
            match event {
                LinkEvent::Open => self.handle_open(epoch),
                LinkEvent::Message(text) => self.handle_message(epoch, text),
                LinkEvent::Error(info) => {
                    self.handle_connection_failure(epoch, &format!("link error: {}", info));
                    return;
                }
                LinkEvent::Close { code, reason } => {
                    self.handle_connection_failure(
                        epoch,
                        &format!("closed by peer ({}): {}", code, reason),
                    );
                    return;
                }
            }
        }
    }

    fn handle_open(self: &Arc<Self>, epoch: u64) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        {
            let mut st = lock(&self.state);
            if st.epoch != epoch {
                return;
            }
            if let Some(t) = st.attempt.take() {
                t.cancel();
            }
            st.failure_count = 0;
            st.connected_at = Some(Utc::now());
            st.last_inbound = Instant::now();
        }

        tracing::info!(transport_id = %self.id, kind = %self.kind, epoch, "Transport connected");
        session.commit_status(self, epoch, TransportStatus::Connected);
        self.start_stability_check(epoch);
    }

    fn handle_message(&self, epoch: u64, text: String) {
        {
            let mut st = lock(&self.state);
            if st.epoch != epoch {
                return;
            }
            st.last_inbound = Instant::now();
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };

        let envelope = match session.codec().decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(transport_id = %self.id, "Dropping undecodable frame: {}", e);
                return;
            }
        };

        if envelope.event == shared::message::PING {
            self.send_control(epoch, &Envelope::pong());
        }
        session.dispatch_inbound(envelope);
    }

    /// Send a transport-level frame directly on the link, bypassing the
    /// outbox. Runs detached so a stalled link cannot block event handling
    /// or the stability ticker.
    fn send_control(&self, epoch: u64, envelope: &Envelope) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let text = match session.codec().encode(envelope) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to encode control frame: {}", e);
                return;
            }
        };
        let (link, connection) = {
            let st = lock(&self.state);
            if st.epoch != epoch {
                return;
            }
            match (st.link.clone(), st.connection.clone()) {
                (Some(link), Some(connection)) => (link, connection),
                _ => return,
            }
        };
        let transport_id = self.id;
        let event = envelope.event.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = connection.cancelled() => {}
                result = link.send(text) => {
                    if let Err(e) = result {
                        tracing::debug!(transport_id = %transport_id, event = %event, "Control frame not sent: {}", e);
                    }
                }
            }
        });
    }

    fn start_stability_check(self: &Arc<Self>, epoch: u64) {
        let interval = self.config.stability_interval;
        if interval.is_zero() {
            return;
        }
        let window = self.config.liveness_window;

        let token = CancellationToken::new();
        {
            let mut st = lock(&self.state);
            if st.epoch != epoch {
                return;
            }
            if let Some(old) = st.stability.replace(token.clone()) {
                old.cancel();
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip immediate tick

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        let silent = {
                            let st = lock(&this.state);
                            if st.epoch != epoch {
                                return;
                            }
                            !window.is_zero() && st.last_inbound.elapsed() > window
                        };
                        if silent {
                            this.handle_connection_failure(epoch, "stability check failed");
                            return;
                        }
                        this.send_control(epoch, &Envelope::ping());
                    }
                }
            }
        });
    }

    // ========================================================================
    // Failure and recovery
    // ========================================================================

    fn handle_connection_failure(self: &Arc<Self>, epoch: u64, reason: &str) {
        let failures = {
            let mut st = lock(&self.state);
            if st.epoch != epoch || st.link.is_none() || self.is_terminated() {
                return;
            }
            st.failure_count += 1;
            st.failure_count
        };

        tracing::warn!(
            transport_id = %self.id,
            kind = %self.kind,
            failures,
            reason,
            "Connection failure"
        );
        self.disconnect(CONNECTION_FAILURE_CODE, reason);

        if failures > self.config.failover_threshold
            && self.kind == TransportKind::Socket
            && let Some(session) = self.session.upgrade()
            && session.switch_transport(self, TransportKind::Http)
        {
            return;
        }
        self.request_reconnect();
    }

    /// Probe until the server is reachable, then connect. A reconnect that
    /// has been pending longer than the stale threshold is restarted.
    pub(crate) fn request_reconnect(self: &Arc<Self>) {
        if self.is_terminated() {
            return;
        }
        let started = Instant::now();
        {
            let mut st = lock(&self.state);
            if let Some(pending) = st.reconnect_started {
                if pending.elapsed() < self.config.stale_reconnect_after {
                    tracing::debug!(transport_id = %self.id, "Reconnect already pending");
                    return;
                }
                tracing::warn!(transport_id = %self.id, "Pending reconnect looks stuck, retrying");
            }
            st.reconnect_started = Some(started);
        }

        let this = self.clone();
        tokio::spawn(async move { this.reconnect(started).await });
    }

    async fn reconnect(self: Arc<Self>, started: Instant) {
        loop {
            if self.is_terminated() {
                return;
            }
            if self.probe.is_reachable(&self.base_url).await {
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.probe_interval) => {}
            }
        }

        {
            let mut st = lock(&self.state);
            // Superseded by a newer attempt, or already reconnected
            if st.reconnect_started != Some(started) || st.link.is_some() {
                return;
            }
            st.reconnect_started = None;
        }

        tracing::info!(transport_id = %self.id, kind = %self.kind, "Server reachable, reconnecting");
        if let Err(e) = self.connect() {
            tracing::warn!(transport_id = %self.id, "Reconnect failed: {}", e);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.probe_interval) => {}
            }
            self.request_reconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryServer;
    use crate::session::Session;
    use std::time::Duration;

    fn reconnect_started(transport: &Transport) -> Option<Instant> {
        lock(&transport.state).reconnect_started
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_reconnect_is_restarted_after_threshold() {
        let server = MemoryServer::new();
        let session = Session::builder(SessionConfig::new("mem://seam.test"))
            .connector(Arc::new(server.connector(TransportKind::Socket)))
            .probe(Arc::new(server.clone()))
            .build()
            .unwrap();
        session.connect().unwrap();
        session.await_connected().await.unwrap();
        let transport = session.transport();

        server.set_reachable(false);
        server.latest().unwrap().close(1006, "network lost");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = reconnect_started(&transport).unwrap();

        // Younger than the threshold: left alone
        tokio::time::sleep(Duration::from_secs(10)).await;
        transport.request_reconnect();
        assert_eq!(reconnect_started(&transport), Some(first));

        tokio::time::sleep(session.config().stale_reconnect_after).await;
        transport.request_reconnect();
        let restarted = reconnect_started(&transport).unwrap();
        assert!(restarted > first);

        // Only the restarted loop connects
        server.set_reachable(true);
        server.wait_for(|s| s.connection_count() == 2).await;
        session.await_connected().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(server.connection_count(), 2);
        assert_eq!(reconnect_started(&transport), None);
    }
}
