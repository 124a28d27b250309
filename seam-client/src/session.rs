//! Session - the logical "always connected" layer over a flaky transport
//!
//! ```text
//!   Call / Mutation / Subscription
//!            │ send(PendingRequest)
//!            ▼
//!   ┌──────────────────────── Session ─────────────────────────┐
//!   │  Outbox ──flush──► active Transport ──► Link ──► wire    │
//!   │    ▲                    │                                │
//!   │    │ purge/flush        │ commit_status(epoch, status)   │
//!   │    └──────── transition lock ──► status broadcast        │
//!   │                                                          │
//!   │  wire ──► Transport ──► dispatch_inbound ──► router      │
//!   │                                   └────────► streams     │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Status transitions are committed under a single lock in a fixed order:
//! purge non-surviving requests, publish the status, trigger an outbox
//! flush, then notify listeners. Anything a listener sends in reaction to
//! `Connected` is queued after the purge and cannot be dropped by it.

use dashmap::DashMap;
use serde_json::Value;
use shared::message::{PUBLISH_TO_TOPIC, PublishToTopicPayload};
use shared::{Codec, Envelope, JsonCodec, RpcError, ServerEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{AuthGate, AuthStatus};
use crate::call::{ActiveCall, ActiveCalls, CallOutcome, CallSlot};
use crate::config::SessionConfig;
use crate::error::{CallFailure, ClientError, ClientResult};
use crate::link::{Connector, HttpConnector, HttpStatusProbe, Probe, WebSocketConnector};
use crate::outbox::{Outbox, PendingRequest};
use crate::router::InboundRouter;
use crate::stream::{StreamHandle, StreamRegistry};
use crate::subscription::Subscription;
use crate::transport::Transport;
use crate::types::{StatusChange, TransportKind, TransportStatus};
use crate::util::{lock, read, write};

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Client session handle. Cheap to clone.
///
/// # Example
///
/// ```ignore
/// let session = Session::builder(SessionConfig::new("https://pos.example.com")).build()?;
/// session.connect()?;
///
/// let call = Call::new(&session, "menu.list", json!({})).public(true);
/// call.invoke().await?;
/// let menu = call.await_result().await;
/// ```
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.inner.config.base_url)
            .field("transport", &*read(&self.inner.transport))
            .field("outbox_len", &self.inner.outbox.len())
            .finish()
    }
}

pub struct SessionInner {
    config: Arc<SessionConfig>,
    codec: Arc<dyn Codec>,
    connectors: HashMap<TransportKind, Arc<dyn Connector>>,
    probe: Arc<dyn Probe>,
    transport: RwLock<Arc<Transport>>,
    /// Status generation; held for the duration of a transition
    transition: Mutex<u64>,
    outbox: Outbox,
    flushing: AtomicBool,
    retry_scheduled: AtomicBool,
    calls: ActiveCalls,
    pub(crate) router: InboundRouter,
    streams: StreamRegistry,
    subscriptions: DashMap<String, Subscription>,
    status_tx: broadcast::Sender<StatusChange>,
    auth: RwLock<Option<Arc<dyn AuthGate>>>,
    next_id: AtomicU64,
    ping_started: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Session`]
pub struct SessionBuilder {
    config: SessionConfig,
    codec: Option<Arc<dyn Codec>>,
    connectors: HashMap<TransportKind, Arc<dyn Connector>>,
    probe: Option<Arc<dyn Probe>>,
    initial_kind: TransportKind,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            codec: None,
            connectors: HashMap::new(),
            probe: None,
            initial_kind: TransportKind::Socket,
        }
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Register a connector for its transport kind
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(connector.kind(), connector);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn initial_kind(mut self, kind: TransportKind) -> Self {
        self.initial_kind = kind;
        self
    }

    /// Build the session. Without explicit connectors the WebSocket and
    /// HTTP links are used; without a probe the HTTP status probe is used.
    pub fn build(self) -> ClientResult<Session> {
        let config = Arc::new(self.config);
        let mut connectors = self.connectors;
        if connectors.is_empty() {
            connectors.insert(
                TransportKind::Socket,
                Arc::new(WebSocketConnector::new(&config)),
            );
            connectors.insert(TransportKind::Http, Arc::new(HttpConnector::new(&config)?));
        }
        let initial = connectors.get(&self.initial_kind).cloned().ok_or_else(|| {
            ClientError::InvalidState(format!(
                "no connector registered for {} transport",
                self.initial_kind
            ))
        })?;
        let probe: Arc<dyn Probe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpStatusProbe::new(&config)?),
        };
        let codec = self.codec.unwrap_or_else(|| Arc::new(JsonCodec));
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        let inner = Arc::new_cyclic(|weak| SessionInner {
            transport: RwLock::new(Transport::new(
                initial,
                probe.clone(),
                config.clone(),
                weak.clone(),
            )),
            config,
            codec,
            connectors,
            probe,
            transition: Mutex::new(0),
            outbox: Outbox::new(),
            flushing: AtomicBool::new(false),
            retry_scheduled: AtomicBool::new(false),
            calls: ActiveCalls::default(),
            router: InboundRouter::new(),
            streams: StreamRegistry::default(),
            subscriptions: DashMap::new(),
            status_tx,
            auth: RwLock::new(None),
            next_id: AtomicU64::new(0),
            ping_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        Ok(Session { inner })
    }
}

// ============================================================================
// Public API
// ============================================================================

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Open the first connection and start the ping loop
    pub fn connect(&self) -> ClientResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.inner.start_ping_loop();
        self.inner.active_transport().connect()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> TransportStatus {
        self.inner.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == TransportStatus::Connected
    }

    /// Kind of the currently active transport
    pub fn kind(&self) -> TransportKind {
        self.inner.active_transport().kind()
    }

    pub fn transport(&self) -> Arc<Transport> {
        self.inner.active_transport()
    }

    pub fn status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    /// Resolve once the session is connected
    pub async fn await_connected(&self) -> ClientResult<()> {
        self.inner.await_connected().await
    }

    /// Run `callback` once the session is connected (immediately if it
    /// already is)
    pub fn on_connected<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if inner.await_connected().await.is_ok() {
                callback().await;
            }
        });
    }

    pub fn next_id(&self) -> u64 {
        self.inner.next_id()
    }

    /// Queue a request and trigger a flush
    pub fn send(&self, request: PendingRequest) -> ClientResult<()> {
        self.inner.send(request)
    }

    /// Publish to a topic (requires auth)
    pub fn publish(&self, topic: &str, topic_id: &str, data: Value) -> ClientResult<()> {
        let payload = PublishToTopicPayload {
            topic: topic.to_string(),
            topic_id: topic_id.to_string(),
            data,
        };
        let message = Envelope::with_payload(PUBLISH_TO_TOPIC, &payload)?;
        self.send(PendingRequest::new(message, true, true))
    }

    /// Subscribe to `topic`, reusing a live subscription if there is one
    pub fn subscribe_topic(
        &self,
        topic: &str,
        topic_id: &str,
        params: Value,
    ) -> ClientResult<Subscription> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let existing = self.inner.subscriptions.get(topic).map(|s| s.clone());
        if let Some(existing) = existing
            && !existing.is_destroyed()
        {
            return Ok(existing);
        }
        let subscription = Subscription::spawn(&self.inner, topic, topic_id, params);
        self.inner
            .subscriptions
            .insert(topic.to_string(), subscription.clone());
        Ok(subscription)
    }

    /// Install the gate consulted by the outbox for auth-requiring requests
    pub fn set_auth_gate(&self, gate: Arc<dyn AuthGate>) {
        *write(&self.inner.auth) = Some(gate);
        self.inner.request_flush();
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.is_authenticated()
    }

    /// Signal a successful login so held-back requests are flushed
    pub fn notify_logged_in(&self) {
        tracing::debug!("Login succeeded, flushing outbox");
        self.inner.request_flush();
    }

    pub fn active_calls(&self) -> Vec<ActiveCall> {
        self.inner.calls.snapshot()
    }

    pub fn is_call_active(&self, call_id: &str) -> bool {
        self.inner.calls.contains(call_id)
    }

    pub fn outbox_snapshot(&self) -> Vec<PendingRequest> {
        self.inner.outbox.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Terminate the transport and stop all background work
    pub fn close(&self) {
        self.inner.close();
    }
}

// ============================================================================
// Internals shared with transports and per-call objects
// ============================================================================

impl SessionInner {
    pub(crate) fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    pub(crate) fn active_transport(&self) -> Arc<Transport> {
        read(&self.transport).clone()
    }

    pub(crate) fn is_active(&self, transport_id: Uuid) -> bool {
        read(&self.transport).id() == transport_id
    }

    pub(crate) fn status(&self) -> TransportStatus {
        self.active_transport().status()
    }

    /// Current status together with its generation
    pub(crate) fn current_change(&self) -> StatusChange {
        let generation = lock(&self.transition);
        let transport = self.active_transport();
        StatusChange {
            status: transport.status(),
            generation: *generation,
            kind: transport.kind(),
        }
    }

    pub(crate) fn status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn next_id(&self) -> u64 {
        let mut current = self.next_id.load(Ordering::Relaxed);
        loop {
            let (next, wrapped) = match current.checked_add(1) {
                Some(next) => (next, false),
                None => (0, true),
            };
            match self.next_id.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if wrapped {
                        tracing::warn!("Session id counter overflowed, wrapping to 0");
                    }
                    return current;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) async fn await_connected(&self) -> ClientResult<()> {
        let mut rx = self.status_tx.subscribe();
        loop {
            if self.is_closed() {
                return Err(ClientError::Closed);
            }
            if self.status() == TransportStatus::Connected {
                return Ok(());
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ClientError::Closed),
                change = rx.recv() => match change {
                    Ok(change) if change.status == TransportStatus::Connected => return Ok(()),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(ClientError::Closed),
                }
            }
        }
    }

    /// Commit a status change reported by `transport` under connection
    /// attempt `epoch`. Ignored if the transport is no longer active or the
    /// epoch is stale.
    pub(crate) fn commit_status(
        self: &Arc<Self>,
        transport: &Transport,
        epoch: u64,
        status: TransportStatus,
    ) -> bool {
        let mut generation = lock(&self.transition);
        if !self.is_active(transport.id()) {
            return false;
        }

        let applied = transport.transition(epoch, status, || {
            if status == TransportStatus::Connected {
                let purged = self.outbox.purge_non_surviving();
                if purged > 0 {
                    tracing::debug!(purged, "Dropped queued requests that do not survive reconnection");
                }
            }
        });
        if !applied {
            return false;
        }

        *generation += 1;
        let change = StatusChange {
            status,
            generation: *generation,
            kind: transport.kind(),
        };
        tracing::info!(
            status = %status,
            generation = change.generation,
            kind = %change.kind,
            "Session status changed"
        );

        if status == TransportStatus::Connected {
            self.request_flush();
        }
        let _ = self.status_tx.send(change);
        true
    }

    /// Replace `from` with a fresh transport of `kind`. Returns false when
    /// no connector is registered for `kind` or `from` is no longer active.
    pub(crate) fn switch_transport(self: &Arc<Self>, from: &Transport, kind: TransportKind) -> bool {
        let Some(connector) = self.connectors.get(&kind).cloned() else {
            tracing::warn!(to = %kind, "No connector for failover target, staying on {}", from.kind());
            return false;
        };
        let next = Transport::new(
            connector,
            self.probe.clone(),
            self.config.clone(),
            Arc::downgrade(self),
        );

        let previous = {
            let _guard = lock(&self.transition);
            let mut current = write(&self.transport);
            if current.id() != from.id() {
                return false;
            }
            std::mem::replace(&mut *current, next.clone())
        };

        tracing::warn!(
            from = %previous.kind(),
            to = %kind,
            failures = previous.failure_count(),
            "Switching transport"
        );
        previous.terminate();

        if let Err(e) = next.connect() {
            tracing::warn!(kind = %kind, "Initial connect on new transport failed: {}", e);
            next.request_reconnect();
        }
        true
    }

    pub(crate) fn send(self: &Arc<Self>, request: PendingRequest) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        tracing::debug!(
            event = %request.message.event,
            requires_auth = request.requires_auth,
            survives_reconnect = request.survives_reconnect,
            "Queued request"
        );
        self.outbox.push(request);
        self.request_flush();
        Ok(())
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        read(&self.auth)
            .as_ref()
            .map(|gate| gate.status() == AuthStatus::LoggedIn)
            .unwrap_or(false)
    }

    // ========================================================================
    // Outbox flushing
    // ========================================================================

    pub(crate) fn request_flush(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.flush_outbox().await });
    }

    async fn flush_outbox(self: &Arc<Self>) {
        if self.status() != TransportStatus::Connected {
            return;
        }
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let transport = self.active_transport();
        let epoch = transport.epoch();
        let authenticated = self.is_authenticated();
        let batch = self
            .outbox
            .flush(|request| authenticated || !request.requires_auth);

        let mut pending = batch.into_iter();
        while let Some(request) = pending.next() {
            let text = match self.codec.encode(&request.message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(event = %request.message.event, "Dropping unencodable request: {}", e);
                    continue;
                }
            };
            if let Err(e) = transport.send(text).await {
                tracing::debug!(event = %request.message.event, "Send failed during flush: {}", e);
                let mut unsent = vec![request];
                unsent.extend(pending);
                self.requeue_unsent(&transport, epoch, unsent);
                break;
            }
            tokio::task::yield_now().await;
        }

        self.flushing.store(false, Ordering::Release);

        if !self.outbox.is_empty() {
            self.schedule_retry_flush();
        }
    }

    /// Put a failed batch back at the front of the outbox. If the
    /// connection it was taken under is gone, the purge for the next
    /// connection may already have run, so non-surviving entries are
    /// dropped here instead.
    fn requeue_unsent(&self, transport: &Transport, epoch: u64, mut unsent: Vec<PendingRequest>) {
        let _generation = lock(&self.transition);
        if !self.is_active(transport.id()) || transport.epoch() != epoch {
            let before = unsent.len();
            unsent.retain(|request| request.survives_reconnect);
            let dropped = before - unsent.len();
            if dropped > 0 {
                tracing::debug!(dropped, "Dropped unsent requests that do not survive reconnection");
            }
        }
        self.outbox.requeue_front(unsent);
    }

    fn schedule_retry_flush(self: &Arc<Self>) {
        if self.retry_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.outbox_retry_delay;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(this) = weak.upgrade() {
                this.retry_scheduled.store(false, Ordering::Release);
                this.flush_outbox().await;
            }
        });
    }

    fn start_ping_loop(self: &Arc<Self>) {
        let interval = self.config.ping_interval;
        if interval.is_zero() || self.ping_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip immediate tick

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let Some(this) = weak.upgrade() else {
                            return;
                        };
                        if this.status() == TransportStatus::Connected {
                            let _ = this.send(PendingRequest::new(Envelope::ping(), false, false));
                        }
                    }
                }
            }
        });
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    pub(crate) fn dispatch_inbound(&self, envelope: Envelope) {
        match envelope.kind() {
            ServerEvent::Ping | ServerEvent::Pong => return,
            ServerEvent::StreamChunk { call_id, stream_id } => {
                self.streams.push(&call_id, &stream_id, envelope.data);
                return;
            }
            _ => {}
        }
        let event = envelope.event;
        if self.router.dispatch(&event, envelope.data) == 0 {
            tracing::debug!(event = %event, "No route for inbound event");
        }
    }

    pub(crate) fn claim_stream(&self, call_id: &str, stream_id: &str) -> StreamHandle {
        self.streams.claim(call_id, stream_id)
    }

    pub(crate) fn open_streams(&self, call_id: &str) {
        self.streams.open(call_id);
    }

    pub(crate) fn close_streams(&self, call_id: &str) {
        self.streams.close(call_id);
    }

    #[cfg(test)]
    pub(crate) fn stream_slots(&self) -> usize {
        self.streams.len()
    }

    // ========================================================================
    // Active calls
    // ========================================================================

    pub(crate) fn register_call(&self, slot: Arc<CallSlot>) -> ClientResult<()> {
        self.calls.insert(slot)
    }

    /// Settle a call exactly once and drop it from the active set. Its
    /// unclaimed streams go too, unless the caller still has to claim them.
    pub(crate) fn settle_call(&self, slot: &CallSlot, outcome: CallOutcome) -> bool {
        if !slot.settle(outcome) {
            return false;
        }
        self.calls.remove(&slot.call_id);
        if !slot.keeps_streams {
            self.streams.close(&slot.call_id);
        }
        true
    }

    /// Fail every registered call. Returns how many were failed.
    pub(crate) fn fail_active_calls(&self, error: RpcError) -> usize {
        let mut failed = 0;
        for slot in self.calls.slots() {
            if self.settle_call(&slot, Err(CallFailure::Rejected(error.clone()))) {
                failed += 1;
            }
        }
        failed
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub(crate) fn forget_subscription(&self, topic: &str, subscription_id: u64) {
        self.subscriptions
            .remove_if(topic, |_, s| s.id() == subscription_id);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(base_url = %self.config.base_url, "Closing session");
        self.shutdown.cancel();
        self.active_transport().terminate();

        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for subscription in subscriptions {
            subscription.destroy();
        }
        self.subscriptions.clear();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(transport) = self.transport.get_mut() {
            transport.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Call;
    use crate::link::MemoryServer;
    use crate::mutation::{Endpoint, Mutation};
    use serde_json::json;
    use shared::message::{CALL, response_event, stream_event};
    use std::time::Duration;

    fn memory_session(server: &MemoryServer) -> Session {
        Session::builder(SessionConfig::new("mem://seam.test"))
            .connector(Arc::new(server.connector(TransportKind::Socket)))
            .probe(Arc::new(server.clone()))
            .build()
            .unwrap()
    }

    async fn connected(server: &MemoryServer) -> Session {
        let session = memory_session(server);
        session.connect().unwrap();
        session.await_connected().await.unwrap();
        session
    }

    fn chunk(call_id: &str, stream_id: &str, n: u64) -> Envelope {
        Envelope::new(
            stream_event(call_id, stream_id),
            json!({"backlog": [n], "ended": false}),
        )
    }

    #[test]
    fn test_next_id_wraps_to_zero() {
        let session = memory_session(&MemoryServer::new());
        session.inner.next_id.store(u64::MAX - 1, Ordering::Relaxed);

        assert_eq!(session.next_id(), u64::MAX - 1);
        assert_eq!(session.next_id(), u64::MAX);
        assert_eq!(session.next_id(), 0);
        assert_eq!(session.next_id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_calls_leave_no_stream_slots() {
        let server = MemoryServer::new();
        let session = connected(&server).await;
        let link = server.latest().unwrap();

        for n in 0..50u64 {
            let call_id = n.to_string();
            let call = Call::with_call_id(&session, call_id.clone(), "reports.export", json!({}))
                .public(true);
            call.invoke().await.unwrap();
            link.deliver(&chunk(&call_id, "rows", n));
            link.deliver(&Envelope::new(response_event(&call_id), json!({"ok": true})));
            assert_eq!(call.await_result().await, Ok(json!({"ok": true})));
        }

        // Late chunk for a call that already settled
        link.deliver(&chunk("0", "rows", 99));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.inner.stream_slots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_without_markers_releases_streams() {
        let server = MemoryServer::new();
        let session = connected(&server).await;
        let mutation = Mutation::new(&session, Endpoint::public("reports.run"));

        let running = tokio::spawn(async move { mutation.call(json!({})).await });
        server.wait_for(|s| s.count(CALL) == 1).await;
        let call_id = server.frames_for(CALL)[0].data["callId"]
            .as_str()
            .unwrap()
            .to_string();

        let link = server.latest().unwrap();
        link.deliver(&chunk(&call_id, "log", 1));
        link.deliver(&Envelope::new(
            response_event(&call_id),
            json!({"mutationResult": {"done": true}, "sideEffectResults": []}),
        ));

        let output = running.await.unwrap().unwrap();
        assert!(output.streams.is_empty());
        assert_eq!(output.value, json!({"done": true}));
        assert_eq!(session.inner.stream_slots(), 0);
    }
}
