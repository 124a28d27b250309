//! Mutation orchestrator
//!
//! Wraps repeated calls to one endpoint and keeps UI-observable state
//! (loading, last error, in-flight calls). Dependent queries registered as
//! side effects ride along with every call so the server can return their
//! fresh results in the same response.

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::message::{CallResponse, SideEffect, stream_marker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::call::Call;
use crate::error::{ClientError, ClientResult, MutationError};
use crate::session::Session;
use crate::stream::StreamHandle;
use crate::util::lock;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    /// Callable without login
    pub is_public: bool,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_public: false,
        }
    }

    pub fn public(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_public: true,
        }
    }
}

/// A dependent read refreshed by mutation responses
pub trait SideEffectQuery: Send + Sync {
    fn endpoint(&self) -> &str;
    fn params(&self) -> Value;
    fn apply_side_effect_result(&self, result: Value);
}

/// In-flight call as tracked by the mutation
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveMutationCall {
    pub mutation_id: String,
    pub started_at: DateTime<Utc>,
    pub params: Value,
}

/// Observable mutation state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationSnapshot {
    pub is_loading: bool,
    pub error: Option<MutationError>,
    pub active_calls: Vec<ActiveMutationCall>,
}

/// Successful mutation result. Stream placeholders in `value` are replaced
/// by their stream id; the live streams are in `streams`, keyed by field.
#[derive(Debug)]
pub struct MutationOutput {
    pub value: Value,
    pub streams: HashMap<String, StreamHandle>,
}

impl MutationOutput {
    pub fn take_stream(&mut self, field: &str) -> Option<StreamHandle> {
        self.streams.remove(field)
    }
}

pub struct Mutation {
    session: Session,
    endpoint: Endpoint,
    is_query: bool,
    timeout: Option<Duration>,
    side_effects: Vec<Option<Arc<dyn SideEffectQuery>>>,
    state: Mutex<MutationSnapshot>,
    changes: broadcast::Sender<MutationSnapshot>,
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("endpoint", &self.endpoint)
            .field("is_query", &self.is_query)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl Mutation {
    pub fn new(session: &Session, endpoint: Endpoint) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            session: session.clone(),
            endpoint,
            is_query: false,
            timeout: None,
            side_effects: Vec::new(),
            state: Mutex::new(MutationSnapshot::default()),
            changes,
        }
    }

    /// A read-only call: not replayed after a reconnect
    pub fn query(session: &Session, endpoint: Endpoint) -> Self {
        Self {
            is_query: true,
            ..Self::new(session, endpoint)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Dependent queries; `None` entries keep their slot so result ids line up
    pub fn with_side_effects(mut self, queries: Vec<Option<Arc<dyn SideEffectQuery>>>) -> Self {
        self.side_effects = queries;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn snapshot(&self) -> MutationSnapshot {
        lock(&self.state).clone()
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).is_loading
    }

    pub fn error(&self) -> Option<MutationError> {
        lock(&self.state).error.clone()
    }

    pub fn active_calls(&self) -> Vec<ActiveMutationCall> {
        lock(&self.state).active_calls.clone()
    }

    /// Receives a snapshot on call start and once per terminal outcome
    pub fn changes(&self) -> broadcast::Receiver<MutationSnapshot> {
        self.changes.subscribe()
    }

    fn update(&self, apply: impl FnOnce(&mut MutationSnapshot)) {
        let snapshot = {
            let mut state = lock(&self.state);
            apply(&mut state);
            state.clone()
        };
        let _ = self.changes.send(snapshot);
    }

    fn side_effect_payloads(&self) -> Vec<SideEffect> {
        self.side_effects
            .iter()
            .enumerate()
            .filter_map(|(index, query)| {
                query.as_ref().map(|q| SideEffect {
                    side_effect_id: index as u32,
                    method: q.endpoint().to_string(),
                    params: q.params(),
                })
            })
            .collect()
    }

    pub async fn call(&self, params: Value) -> ClientResult<MutationOutput> {
        let mut call = Call::new(&self.session, self.endpoint.name.clone(), params.clone())
            .public(self.endpoint.is_public)
            .query(self.is_query)
            .with_side_effects(self.side_effect_payloads())
            .keep_streams();
        if let Some(timeout) = self.timeout {
            call = call.with_timeout(timeout);
        }
        let mutation_id = call.call_id().to_string();

        self.update(|state| {
            state.is_loading = true;
            state.error = None;
            state.active_calls.push(ActiveMutationCall {
                mutation_id: mutation_id.clone(),
                started_at: Utc::now(),
                params,
            });
        });

        let output = self.run(&call, &mutation_id).await;
        // Streams not claimed by now have no owner
        self.session.inner.close_streams(&mutation_id);
        output
    }

    async fn run(&self, call: &Call, mutation_id: &str) -> ClientResult<MutationOutput> {
        let result = match call.invoke().await {
            Ok(()) => call.await_result().await,
            Err(e) => {
                self.update(|state| finish(state, mutation_id));
                return Err(e);
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(failure) => {
                let error = MutationError::from_failure(&self.endpoint.name, failure);
                tracing::debug!(endpoint = %self.endpoint.name, "Mutation failed: {}", error);
                self.update(|state| {
                    finish(state, mutation_id);
                    state.error = Some(error.clone());
                });
                return Err(ClientError::Mutation(error));
            }
        };

        let response: CallResponse = match serde_json::from_value(response) {
            Ok(response) => response,
            Err(e) => {
                self.update(|state| finish(state, mutation_id));
                return Err(e.into());
            }
        };

        for result in response.side_effect_results {
            match self
                .side_effects
                .get(result.side_effect_id as usize)
                .and_then(Option::as_ref)
            {
                Some(query) => query.apply_side_effect_result(result.result),
                None => tracing::debug!(
                    side_effect_id = result.side_effect_id,
                    "Side effect result without a matching query"
                ),
            }
        }

        let mut value = response.mutation_result;
        let mut streams = HashMap::new();
        if let Some(fields) = value.as_object_mut() {
            for (field, slot) in fields.iter_mut() {
                let Some(stream_id) = stream_marker(slot).map(str::to_string) else {
                    continue;
                };
                streams.insert(
                    field.clone(),
                    self.session.inner.claim_stream(mutation_id, &stream_id),
                );
                *slot = Value::String(stream_id);
            }
        }

        self.update(|state| finish(state, mutation_id));
        Ok(MutationOutput { value, streams })
    }
}

fn finish(state: &mut MutationSnapshot, mutation_id: &str) {
    state.active_calls.retain(|c| c.mutation_id != mutation_id);
    state.is_loading = !state.active_calls.is_empty();
}
