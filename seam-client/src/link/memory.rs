//! In-process links
//!
//! [`MemoryServer`] plays the remote end: it accepts links opened by
//! [`MemoryConnector`], records every frame the client sends, and lets the
//! caller inject open/message/error/close events per connection. It also
//! doubles as the reachability [`Probe`].

use async_trait::async_trait;
use shared::{Codec, Envelope, JsonCodec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

use super::{Connector, Link, LinkEvent, Probe};
use crate::error::{ClientError, ClientResult};
use crate::types::TransportKind;
use crate::util::lock;

#[derive(Debug)]
struct ServerInner {
    connections: Mutex<Vec<MemoryConnection>>,
    frames: Mutex<Vec<(usize, String)>>,
    auto_open: AtomicBool,
    answer_pings: AtomicBool,
    fail_sends: AtomicBool,
    stall_sends: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    reachable: AtomicBool,
    changed: Notify,
}

/// Remote end of in-process links
#[derive(Debug, Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// Links open immediately and pings are answered with pongs
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                connections: Mutex::new(Vec::new()),
                frames: Mutex::new(Vec::new()),
                auto_open: AtomicBool::new(true),
                answer_pings: AtomicBool::new(true),
                fail_sends: AtomicBool::new(false),
                stall_sends: AtomicBool::new(false),
                send_delay: Mutex::new(None),
                reachable: AtomicBool::new(true),
                changed: Notify::new(),
            }),
        }
    }

    pub fn connector(&self, kind: TransportKind) -> MemoryConnector {
        MemoryConnector {
            kind,
            server: self.clone(),
        }
    }

    pub fn set_auto_open(&self, enabled: bool) {
        self.inner.auto_open.store(enabled, Ordering::Release);
    }

    pub fn set_answer_pings(&self, enabled: bool) {
        self.inner.answer_pings.store(enabled, Ordering::Release);
    }

    /// Make every client send fail
    pub fn set_fail_sends(&self, enabled: bool) {
        self.inner.fail_sends.store(enabled, Ordering::Release);
    }

    /// Links accepted from now on never complete a send
    pub fn set_stall_sends(&self, enabled: bool) {
        self.inner.stall_sends.store(enabled, Ordering::Release);
    }

    /// Latency of every send on links accepted from now on
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *lock(&self.inner.send_delay) = delay;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::Release);
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn connection(&self, index: usize) -> Option<MemoryConnection> {
        lock(&self.inner.connections).get(index).cloned()
    }

    pub fn latest(&self) -> Option<MemoryConnection> {
        lock(&self.inner.connections).last().cloned()
    }

    /// Every decodable frame received so far, in arrival order
    pub fn frames(&self) -> Vec<Envelope> {
        lock(&self.inner.frames)
            .iter()
            .filter_map(|(_, text)| JsonCodec.decode(text).ok())
            .collect()
    }

    pub fn frames_for(&self, event: &str) -> Vec<Envelope> {
        self.frames()
            .into_iter()
            .filter(|env| env.event == event)
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.frames_for(event).len()
    }

    pub fn clear_frames(&self) {
        lock(&self.inner.frames).clear();
    }

    /// Resolve once `pred` holds; re-checked on every frame or connection
    pub async fn wait_for(&self, pred: impl Fn(&MemoryServer) -> bool) {
        loop {
            let notified = self.inner.changed.notified();
            if pred(self) {
                return;
            }
            notified.await;
        }
    }

    fn accept(&self, kind: TransportKind) -> (Arc<dyn Link>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let connection = {
            let mut connections = lock(&self.inner.connections);
            let connection = MemoryConnection {
                id: connections.len(),
                kind,
                events: events.clone(),
                closed: Arc::new(Mutex::new(None)),
            };
            connections.push(connection.clone());
            connection
        };

        if self.inner.auto_open.load(Ordering::Acquire) {
            connection.open();
        }
        self.inner.changed.notify_waiters();

        let link = MemoryLink {
            connection_id: connection.id,
            stalled: self.inner.stall_sends.load(Ordering::Acquire),
            delay: *lock(&self.inner.send_delay),
            server: self.inner.clone(),
            events,
            closed: connection.closed.clone(),
        };
        (Arc::new(link), rx)
    }
}

#[async_trait]
impl Probe for MemoryServer {
    async fn is_reachable(&self, _base_url: &str) -> bool {
        self.inner.reachable.load(Ordering::Acquire)
    }
}

/// Server-side handle on one accepted link
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    pub id: usize,
    pub kind: TransportKind,
    events: mpsc::UnboundedSender<LinkEvent>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl MemoryConnection {
    pub fn open(&self) {
        let _ = self.events.send(LinkEvent::Open);
    }

    pub fn deliver(&self, envelope: &Envelope) {
        if let Ok(text) = JsonCodec.encode(envelope) {
            self.deliver_raw(text);
        }
    }

    pub fn deliver_raw(&self, text: impl Into<String>) {
        let _ = self.events.send(LinkEvent::Message(text.into()));
    }

    pub fn error(&self, info: impl Into<String>) {
        let _ = self.events.send(LinkEvent::Error(info.into()));
    }

    /// Close from the server side
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.events.send(LinkEvent::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Close code and reason the client used, if it closed this link
    pub fn closed_with(&self) -> Option<(u16, String)> {
        lock(&self.closed).clone()
    }
}

/// Opens in-process links against a [`MemoryServer`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    kind: TransportKind,
    server: MemoryServer,
}

impl Connector for MemoryConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn open(
        &self,
        _base_url: &str,
    ) -> ClientResult<(Arc<dyn Link>, mpsc::UnboundedReceiver<LinkEvent>)> {
        Ok(self.server.accept(self.kind))
    }
}

#[derive(Debug)]
struct MemoryLink {
    connection_id: usize,
    stalled: bool,
    delay: Option<Duration>,
    server: Arc<ServerInner>,
    events: mpsc::UnboundedSender<LinkEvent>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, text: String) -> ClientResult<()> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.server.fail_sends.load(Ordering::Acquire) {
            return Err(ClientError::Connection("memory link refused send".to_string()));
        }
        if lock(&self.closed).is_some() {
            return Err(ClientError::Connection("memory link closed".to_string()));
        }

        let is_ping = JsonCodec
            .decode(&text)
            .map(|env| env.event == shared::message::PING)
            .unwrap_or(false);
        lock(&self.server.frames).push((self.connection_id, text));

        if is_ping && self.server.answer_pings.load(Ordering::Acquire) {
            if let Ok(pong) = JsonCodec.encode(&Envelope::pong()) {
                let _ = self.events.send(LinkEvent::Message(pong));
            }
        }
        self.server.changed.notify_waiters();
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        {
            let mut closed = lock(&self.closed);
            if closed.is_some() {
                return;
            }
            *closed = Some((code, reason.to_string()));
        }
        let _ = self.events.send(LinkEvent::Close {
            code,
            reason: reason.to_string(),
        });
        self.server.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_are_recorded_and_pings_answered() {
        let server = MemoryServer::new();
        let connector = server.connector(TransportKind::Socket);
        let (link, mut events) = connector.open("mem://").unwrap();

        assert_eq!(events.recv().await, Some(LinkEvent::Open));

        let ping = JsonCodec.encode(&Envelope::ping()).unwrap();
        link.send(ping).await.unwrap();

        assert_eq!(server.count("ping"), 1);
        match events.recv().await {
            Some(LinkEvent::Message(text)) => {
                assert_eq!(JsonCodec.decode(&text).unwrap().event, "pong");
            }
            other => panic!("expected pong, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_latency_is_fixed_per_link() {
        let server = MemoryServer::new();
        server.set_send_delay(Some(Duration::from_secs(5)));
        let (slow, _slow_events) = server.connector(TransportKind::Socket).open("mem://").unwrap();
        server.set_send_delay(None);
        server.set_stall_sends(true);
        let (stalled, _stalled_events) =
            server.connector(TransportKind::Socket).open("mem://").unwrap();

        let started = tokio::time::Instant::now();
        slow.send("{}".into()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));

        let stuck = tokio::time::timeout(Duration::from_secs(60), stalled.send("{}".into())).await;
        assert!(stuck.is_err());
        assert_eq!(lock(&server.inner.frames).len(), 1);
    }

    #[tokio::test]
    async fn test_client_close_is_recorded_once() {
        let server = MemoryServer::new();
        server.set_auto_open(false);
        let (link, mut events) = server.connector(TransportKind::Http).open("mem://").unwrap();

        link.close(3901, "terminated");
        link.close(3900, "again");

        assert_eq!(
            server.latest().unwrap().closed_with(),
            Some((3901, "terminated".to_string()))
        );
        assert!(matches!(events.recv().await, Some(LinkEvent::Close { code: 3901, .. })));
        assert!(link.send("{}".into()).await.is_err());
    }
}
