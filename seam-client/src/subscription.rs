//! Topic subscriptions
//!
//! The server forgets subscriptions when a connection drops, so each
//! subscription re-sends `SUBSCRIBE_TO_TOPIC` whenever the session
//! becomes connected (once per `Connected` generation). Publications are
//! fanned out to ref-counted listeners. A rejected subscribe, or the last
//! listener stopping, destroys the subscription.
//!
//! Destroying does not tell the server; it stops routing and stops
//! re-subscribing.

use serde_json::Value;
use shared::message::{
    SUBSCRIBE_TO_TOPIC, SubscribeToTopicPayload, publication_event, subscription_result_event,
};
use shared::Envelope;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, ClientResult};
use crate::outbox::PendingRequest;
use crate::router::RouteHandle;
use crate::session::SessionInner;
use crate::types::{StatusChange, TransportStatus};
use crate::util::lock;

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

struct SubscriptionInner {
    id: u64,
    topic: String,
    topic_id: String,
    params: Value,
    session: Weak<SessionInner>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    destroyed: AtomicBool,
    cancel: CancellationToken,
    /// Cancels the wait for the previous subscribe attempt's result
    pending_result: Mutex<Option<CancellationToken>>,
}

/// Live subscription to one topic. Cheap to clone.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("topic", &self.inner.topic)
            .field("listeners", &self.listener_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn spawn(
        session: &Arc<SessionInner>,
        topic: &str,
        topic_id: &str,
        params: Value,
    ) -> Self {
        let subscription = Self {
            inner: Arc::new(SubscriptionInner {
                id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
                topic: topic.to_string(),
                topic_id: topic_id.to_string(),
                params,
                session: Arc::downgrade(session),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                pending_result: Mutex::new(None),
            }),
        };

        // Subscribe to status and publications before sampling the
        // current status so no transition slips through.
        let status_rx = session.status_changes();
        let publications = session.router.subscribe(&publication_event(topic), false);
        let current = session.current_change();

        tracing::debug!(topic, "Subscription created");
        tokio::spawn(subscription.clone().run(status_rx, publications, current));
        subscription
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Resolves once the subscription is destroyed
    pub async fn destroyed(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Register a callback for publications on this topic
    pub fn listen(
        &self,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ClientResult<TopicListener> {
        if self.is_destroyed() {
            return Err(ClientError::InvalidState(format!(
                "subscription to {} is destroyed",
                self.inner.topic
            )));
        }
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).push((id, Arc::new(callback)));
        Ok(TopicListener {
            subscription: self.clone(),
            id,
            stopped: AtomicBool::new(false),
        })
    }

    fn remove_listener(&self, id: u64) {
        let remaining = {
            let mut listeners = lock(&self.inner.listeners);
            listeners.retain(|(listener_id, _)| *listener_id != id);
            listeners.len()
        };
        if remaining == 0 {
            tracing::debug!(topic = %self.inner.topic, "Last listener stopped");
            self.destroy();
        }
    }

    /// Stop routing publications and re-subscribing. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(topic = %self.inner.topic, "Subscription destroyed");
        self.inner.cancel.cancel();
        lock(&self.inner.listeners).clear();
        if let Some(session) = self.inner.session.upgrade() {
            session.forget_subscription(&self.inner.topic, self.inner.id);
        }
    }

    async fn run(
        self,
        mut status_rx: broadcast::Receiver<StatusChange>,
        mut publications: RouteHandle,
        current: StatusChange,
    ) {
        let mut last_generation = current.generation;
        if current.status == TransportStatus::Connected {
            self.ensure_subscribed();
        }

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,

                change = status_rx.recv() => match change {
                    Ok(change) => {
                        if change.status == TransportStatus::Connected
                            && change.generation > last_generation
                        {
                            last_generation = change.generation;
                            self.ensure_subscribed();
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(topic = %self.inner.topic, skipped = n, "Subscription lagged status changes");
                        if let Some(session) = self.inner.session.upgrade() {
                            let now = session.current_change();
                            if now.status == TransportStatus::Connected
                                && now.generation > last_generation
                            {
                                last_generation = now.generation;
                                self.ensure_subscribed();
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                },

                data = publications.rx.recv() => match data {
                    Some(data) => self.fan_out(&data),
                    None => break,
                },
            }
        }

        if let Some(session) = self.inner.session.upgrade() {
            session.router.unsubscribe(&publications.event, publications.id);
        }
        if let Some(token) = lock(&self.inner.pending_result).take() {
            token.cancel();
        }
    }

    fn fan_out(&self, data: &Value) {
        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(data);
        }
    }

    fn ensure_subscribed(&self) {
        if self.is_destroyed() {
            return;
        }
        let Some(session) = self.inner.session.upgrade() else {
            return;
        };

        let payload = SubscribeToTopicPayload {
            topic: self.inner.topic.clone(),
            topic_id: self.inner.topic_id.clone(),
            params: self.inner.params.clone(),
        };
        let message = match Envelope::with_payload(SUBSCRIBE_TO_TOPIC, &payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(topic = %self.inner.topic, "Failed to build subscribe message: {}", e);
                return;
            }
        };

        let mut result = session
            .router
            .subscribe(&subscription_result_event(&self.inner.topic), true);
        let waiting = CancellationToken::new();
        if let Some(previous) = lock(&self.inner.pending_result).replace(waiting.clone()) {
            previous.cancel();
        }

        // The reconnect handler re-issues this, so it must not survive one
        if let Err(e) = session.send(PendingRequest::new(message, true, false)) {
            tracing::debug!(topic = %self.inner.topic, "Subscribe not sent: {}", e);
            session.router.unsubscribe(&result.event, result.id);
            return;
        }
        tracing::debug!(topic = %self.inner.topic, "Subscribe sent");

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = waiting.cancelled() => {}
                data = result.rx.recv() => {
                    if let Some(data) = data {
                        this.handle_subscription_result(&data);
                    }
                }
            }
            if let Some(session) = this.inner.session.upgrade() {
                session.router.unsubscribe(&result.event, result.id);
            }
        });
    }

    fn handle_subscription_result(&self, data: &Value) {
        if is_rejection(data) {
            tracing::warn!(topic = %self.inner.topic, error = %data, "Subscription rejected by server");
            self.destroy();
        }
    }
}

/// Anything but `true` that carries an `error` key, even a null one
fn is_rejection(data: &Value) -> bool {
    *data != Value::Bool(true) && data.get("error").is_some()
}

/// Registration handle for one listener. Stopping (or dropping) the last
/// handle destroys the subscription.
#[derive(Debug)]
pub struct TopicListener {
    subscription: Subscription,
    id: u64,
    stopped: AtomicBool,
}

impl TopicListener {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscription.remove_listener(self.id);
    }
}

impl Drop for TopicListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rejection_is_any_error_key_except_true() {
        assert!(!is_rejection(&json!(true)));
        assert!(!is_rejection(&json!({"subscribed": true})));
        assert!(!is_rejection(&json!(false)));
        assert!(is_rejection(&json!({"error": "Forbidden"})));
        assert!(is_rejection(&json!({"error": null})));
        assert!(is_rejection(&json!({"_isRpcError": true, "code": 403, "error": "Forbidden"})));
    }
}
