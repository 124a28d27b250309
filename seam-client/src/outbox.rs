//! Outbox: ordered buffer of requests waiting for a connected transport
//!
//! The buffer itself is passive. The flush driver that decides *when* to
//! drain it lives on the session, which knows connectivity and auth state.

use shared::Envelope;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::util::lock;

/// A request waiting in the outbox
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub message: Envelope,
    /// Held back while the session is not logged in
    pub requires_auth: bool,
    /// Kept across a reconnect; dropped otherwise
    pub survives_reconnect: bool,
}

impl PendingRequest {
    pub fn new(message: Envelope, requires_auth: bool, survives_reconnect: bool) -> Self {
        Self {
            message,
            requires_auth,
            survives_reconnect,
        }
    }
}

#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<PendingRequest>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: PendingRequest) {
        lock(&self.queue).push_back(request);
    }

    /// Remove and return, in order, every entry matching `predicate`.
    /// Non-matching entries stay put in their original relative order.
    pub fn flush(&self, predicate: impl Fn(&PendingRequest) -> bool) -> Vec<PendingRequest> {
        let mut queue = lock(&self.queue);
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        for request in queue.drain(..) {
            if predicate(&request) {
                taken.push(request);
            } else {
                kept.push_back(request);
            }
        }
        *queue = kept;
        taken
    }

    /// Drop every entry that should not be replayed after a reconnect.
    /// Returns how many were dropped.
    pub fn purge_non_surviving(&self) -> usize {
        let mut queue = lock(&self.queue);
        let before = queue.len();
        queue.retain(|r| r.survives_reconnect);
        before - queue.len()
    }

    /// Put entries back ahead of everything queued, keeping their order
    pub fn requeue_front(&self, requests: Vec<PendingRequest>) {
        let mut queue = lock(&self.queue);
        for request in requests.into_iter().rev() {
            queue.push_front(request);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingRequest> {
        lock(&self.queue).iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(n: u32, requires_auth: bool, survives: bool) -> PendingRequest {
        PendingRequest::new(Envelope::new("call", json!(n)), requires_auth, survives)
    }

    fn ids(requests: &[PendingRequest]) -> Vec<u64> {
        requests
            .iter()
            .map(|r| r.message.data.as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_flush_preserves_order_on_both_sides() {
        let outbox = Outbox::new();
        for n in 0..8 {
            outbox.push(req(n, n % 3 == 0, true));
        }

        let sent = outbox.flush(|r| !r.requires_auth);

        assert_eq!(ids(&sent), vec![1, 2, 4, 5, 7]);
        assert_eq!(ids(&outbox.snapshot()), vec![0, 3, 6]);
    }

    #[test]
    fn test_flush_with_nothing_matching_leaves_queue_intact() {
        let outbox = Outbox::new();
        outbox.push(req(1, true, true));
        outbox.push(req(2, true, false));

        assert!(outbox.flush(|_| false).is_empty());
        assert_eq!(ids(&outbox.snapshot()), vec![1, 2]);
    }

    #[test]
    fn test_purge_keeps_only_surviving_requests() {
        let outbox = Outbox::new();
        outbox.push(req(1, false, false));
        outbox.push(req(2, false, true));
        outbox.push(req(3, true, false));
        outbox.push(req(4, true, true));

        assert_eq!(outbox.purge_non_surviving(), 2);
        assert_eq!(ids(&outbox.snapshot()), vec![2, 4]);
    }

    #[test]
    fn test_requeue_front_goes_ahead_of_newer_entries() {
        let outbox = Outbox::new();
        outbox.push(req(9, false, true));

        outbox.requeue_front(vec![req(1, false, true), req(2, false, true)]);

        assert_eq!(ids(&outbox.snapshot()), vec![1, 2, 9]);
        assert_eq!(outbox.len(), 3);
    }
}
