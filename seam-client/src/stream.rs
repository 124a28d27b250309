//! Streamed sub-results of a call
//!
//! A call response may mark a field as a stream; the server then pushes
//! `{backlog, ended}` chunks on `response.<callId>.<streamId>`. Chunks can
//! arrive before the response that announces the stream, so the registry
//! buffers per `(callId, streamId)` until a [`StreamHandle`] claims it.

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use shared::message::StreamChunk;
use tokio::sync::mpsc;

#[derive(Debug)]
struct StreamSlot {
    tx: mpsc::UnboundedSender<StreamChunk>,
    rx: Option<mpsc::UnboundedReceiver<StreamChunk>>,
    ended: bool,
}

impl StreamSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            ended: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StreamRegistry {
    slots: DashMap<(String, String), StreamSlot>,
    /// Calls whose unclaimed streams are still wanted
    open: DashSet<String>,
}

impl StreamRegistry {
    /// Start accepting chunks for `call_id`
    pub(crate) fn open(&self, call_id: &str) {
        self.open.insert(call_id.to_string());
    }

    /// Stop accepting chunks for `call_id` and drop its unclaimed slots.
    /// Claimed streams keep flowing until their end marker.
    pub(crate) fn close(&self, call_id: &str) {
        self.open.remove(call_id);
        self.slots
            .retain(|(id, _), slot| id != call_id || slot.rx.is_none());
    }

    pub(crate) fn push(&self, call_id: &str, stream_id: &str, data: Value) {
        let chunk: StreamChunk = match serde_json::from_value(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(call_id, stream_id, "Malformed stream chunk: {}", e);
                return;
            }
        };
        let key = (call_id.to_string(), stream_id.to_string());
        if !self.open.contains(call_id) && !self.slots.contains_key(&key) {
            tracing::debug!(call_id, stream_id, "Dropping chunk for a finished call");
            return;
        }

        let ended = chunk.ended;
        let (claimed, delivered) = {
            let mut slot = self.slots.entry(key.clone()).or_insert_with(StreamSlot::new);
            let delivered = slot.tx.send(chunk).is_ok();
            slot.ended |= ended;
            (slot.rx.is_none(), delivered)
        };
        // Claimed and finished, or the handle is gone
        if claimed && (ended || !delivered) {
            self.slots.remove(&key);
        }
        // Closed while this chunk was being stored
        if !self.open.contains(call_id) {
            self.slots.remove_if(&key, |_, slot| slot.rx.is_some());
        }
    }

    pub(crate) fn claim(&self, call_id: &str, stream_id: &str) -> StreamHandle {
        let key = (call_id.to_string(), stream_id.to_string());
        let (rx, ended) = {
            let mut slot = self.slots.entry(key.clone()).or_insert_with(StreamSlot::new);
            let rx = slot.rx.take().unwrap_or_else(|| {
                // Claimed twice: hand out a channel that is already closed
                let (_, rx) = mpsc::unbounded_channel();
                rx
            });
            (rx, slot.ended)
        };
        if ended {
            self.slots.remove(&key);
        }
        StreamHandle {
            stream_id: stream_id.to_string(),
            rx,
            ended: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Live stream bound to one call
#[derive(Debug)]
pub struct StreamHandle {
    stream_id: String,
    rx: mpsc::UnboundedReceiver<StreamChunk>,
    ended: bool,
}

impl StreamHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Next backlog in arrival order; `None` once the end marker was seen
    pub async fn next_chunk(&mut self) -> Option<Vec<Value>> {
        if self.ended {
            return None;
        }
        let chunk = self.rx.recv().await?;
        if chunk.ended {
            self.ended = true;
        }
        Some(chunk.backlog)
    }

    /// Drain the stream to its end
    pub async fn collect(mut self) -> Vec<Value> {
        let mut all = Vec::new();
        while let Some(backlog) = self.next_chunk().await {
            all.extend(backlog);
        }
        all
    }
}
