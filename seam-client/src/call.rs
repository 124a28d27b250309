//! Call correlator - one request bound to its eventual response
//!
//! ```text
//!  invoke()
//!    ├─ await connected (suspends while offline)
//!    ├─ route  response.<callId>  ─┐
//!    ├─ register in active set     │   first of:
//!    └─ queue `call` on outbox     ├─► response   → Ok / Rejected
//!                                  ├─► timeout    → Timeout
//!                                  └─► disconnect → Rejected(Connection Interrupted)
//! ```
//!
//! The terminal outcome is stored once; later outcomes are dropped.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use shared::message::{CALL, CallPayload, SideEffect, response_event};
use shared::{Envelope, RpcError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{CallFailure, ClientError, ClientResult};
use crate::outbox::PendingRequest;
use crate::session::Session;
use crate::util::sleep_or_forever;

pub(crate) type CallOutcome = Result<Value, CallFailure>;

/// Registered call, as seen from the session's active set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCall {
    pub call_id: String,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct CallSlot {
    pub(crate) call_id: String,
    pub(crate) endpoint: String,
    created_at: DateTime<Utc>,
    outcome: watch::Sender<Option<CallOutcome>>,
    done: CancellationToken,
    /// Streams outlive settlement; the owner closes them after claiming
    pub(crate) keeps_streams: bool,
}

impl CallSlot {
    fn new(call_id: String, endpoint: String) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            call_id,
            endpoint,
            created_at: Utc::now(),
            outcome,
            done: CancellationToken::new(),
            keeps_streams: false,
        }
    }

    /// Store the terminal outcome. Only the first call wins.
    pub(crate) fn settle(&self, outcome: CallOutcome) -> bool {
        let won = self.outcome.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        });
        if won {
            self.done.cancel();
        }
        won
    }

    fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ActiveCalls {
    entries: DashMap<String, Arc<CallSlot>>,
}

impl ActiveCalls {
    pub(crate) fn insert(&self, slot: Arc<CallSlot>) -> ClientResult<()> {
        match self.entries.entry(slot.call_id.clone()) {
            Entry::Occupied(_) => Err(ClientError::InvalidState(format!(
                "callId {} is already active",
                slot.call_id
            ))),
            Entry::Vacant(v) => {
                v.insert(slot);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&self, call_id: &str) {
        self.entries.remove(call_id);
    }

    pub(crate) fn contains(&self, call_id: &str) -> bool {
        self.entries.contains_key(call_id)
    }

    pub(crate) fn slots(&self) -> Vec<Arc<CallSlot>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<ActiveCall> {
        self.entries
            .iter()
            .map(|e| ActiveCall {
                call_id: e.call_id.clone(),
                endpoint: e.endpoint.clone(),
                created_at: e.created_at,
            })
            .collect()
    }
}

/// One outgoing call
#[derive(Debug)]
pub struct Call {
    session: Session,
    endpoint: String,
    params: Value,
    side_effects: Vec<SideEffect>,
    requires_auth: bool,
    survives_reconnect: bool,
    timeout: Duration,
    invoked: AtomicBool,
    slot: Arc<CallSlot>,
}

impl Call {
    /// A call to a private, replayable endpoint with a session-issued id
    pub fn new(session: &Session, endpoint: impl Into<String>, params: Value) -> Self {
        let call_id = session.next_id().to_string();
        Self::with_call_id(session, call_id, endpoint, params)
    }

    pub fn with_call_id(
        session: &Session,
        call_id: impl Into<String>,
        endpoint: impl Into<String>,
        params: Value,
    ) -> Self {
        let endpoint = endpoint.into();
        Self {
            session: session.clone(),
            params,
            side_effects: Vec::new(),
            requires_auth: true,
            survives_reconnect: true,
            timeout: session.config().call_timeout,
            invoked: AtomicBool::new(false),
            slot: Arc::new(CallSlot::new(call_id.into(), endpoint.clone())),
            endpoint,
        }
    }

    /// Public endpoints are sent without waiting for login
    pub fn public(mut self, is_public: bool) -> Self {
        self.requires_auth = !is_public;
        self
    }

    /// Queries are dropped from the outbox on reconnect instead of replayed
    pub fn query(mut self, is_query: bool) -> Self {
        self.survives_reconnect = !is_query;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_side_effects(mut self, side_effects: Vec<SideEffect>) -> Self {
        self.side_effects = side_effects;
        self
    }

    /// Keep unclaimed streams after settling; the caller must close them
    pub(crate) fn keep_streams(mut self) -> Self {
        if let Some(slot) = Arc::get_mut(&mut self.slot) {
            slot.keeps_streams = true;
        }
        self
    }

    pub fn call_id(&self) -> &str {
        &self.slot.call_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_settled(&self) -> bool {
        self.slot.is_settled()
    }

    /// Send the call. May be invoked once; waits for connectivity first.
    pub async fn invoke(&self) -> ClientResult<()> {
        if self.invoked.swap(true, Ordering::AcqRel) {
            return Err(ClientError::InvalidState(format!(
                "call {} to {} invoked twice",
                self.slot.call_id, self.endpoint
            )));
        }

        let inner = &self.session.inner;
        if !self.session.is_connected()
            && let Err(e) = inner.await_connected().await
        {
            self.slot
                .settle(Err(CallFailure::Rejected(RpcError::connection_interrupted())));
            return Err(e);
        }

        let call_id = self.slot.call_id.clone();
        let mut route = inner.router.subscribe(&response_event(&call_id), true);
        if let Err(e) = inner.register_call(self.slot.clone()) {
            inner.router.unsubscribe(&route.event, route.id);
            self.slot
                .settle(Err(CallFailure::Rejected(RpcError::new(409, e.to_string()))));
            return Err(e);
        }
        inner.open_streams(&call_id);

        let payload = CallPayload {
            method: self.endpoint.clone(),
            params: self.params.clone(),
            call_id: call_id.clone(),
            side_effects: self.side_effects.clone(),
        };
        let message = match Envelope::with_payload(CALL, &payload) {
            Ok(message) => message,
            Err(e) => {
                inner.router.unsubscribe(&route.event, route.id);
                inner.settle_call(
                    &self.slot,
                    Err(CallFailure::Rejected(RpcError::new(400, e.to_string()))),
                );
                return Err(e.into());
            }
        };

        // Watch for the first terminal event
        let watcher = inner.clone();
        let slot = self.slot.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = slot.done.cancelled() => {}
                data = route.rx.recv() => {
                    if let Some(data) = data {
                        watcher.settle_call(&slot, classify_response(data));
                    }
                }
                _ = sleep_or_forever(timeout) => {
                    tracing::warn!(call_id = %slot.call_id, endpoint = %slot.endpoint, "Call timed out");
                    watcher.settle_call(
                        &slot,
                        Err(CallFailure::Timeout { endpoint: slot.endpoint.clone() }),
                    );
                }
            }
            watcher.router.unsubscribe(&route.event, route.id);
        });

        tracing::debug!(call_id = %call_id, endpoint = %self.endpoint, "Invoking call");
        if let Err(e) = inner.send(PendingRequest::new(
            message,
            self.requires_auth,
            self.survives_reconnect,
        )) {
            inner.settle_call(
                &self.slot,
                Err(CallFailure::Rejected(RpcError::connection_interrupted())),
            );
            return Err(e);
        }
        Ok(())
    }

    /// Wait for the terminal outcome. Only meaningful after `invoke`.
    pub async fn await_result(&self) -> Result<Value, CallFailure> {
        let mut rx = self.slot.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(CallFailure::Rejected(RpcError::connection_interrupted())))
    }
}

fn classify_response(data: Value) -> CallOutcome {
    match RpcError::from_value(&data) {
        Some(error) => Err(CallFailure::Rejected(error)),
        None => Ok(data),
    }
}
