//! Inbound message routing
//!
//! Routes are keyed by the full event name (`response.17`,
//! `publication.orders`, `AUTH_SUCCESS`, ...). A route is either
//! persistent or fires once and is dropped. Routes whose receiver has gone
//! away are pruned on the next dispatch.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Debug)]
struct Route {
    id: u64,
    once: bool,
    tx: mpsc::UnboundedSender<Value>,
}

/// Handle returned by [`InboundRouter::subscribe`]
#[derive(Debug)]
pub struct RouteHandle {
    pub id: u64,
    pub event: String,
    pub rx: mpsc::UnboundedReceiver<Value>,
}

#[derive(Debug, Default)]
pub struct InboundRouter {
    routes: DashMap<String, Vec<Route>>,
    next_id: AtomicU64,
}

impl InboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str, once: bool) -> RouteHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .entry(event.to_string())
            .or_default()
            .push(Route { id, once, tx });
        RouteHandle {
            id,
            event: event.to_string(),
            rx,
        }
    }

    pub fn unsubscribe(&self, event: &str, id: u64) {
        if let Some(mut routes) = self.routes.get_mut(event) {
            routes.retain(|r| r.id != id);
        }
        self.routes.remove_if(event, |_, routes| routes.is_empty());
    }

    /// Deliver `data` to every route for `event`. Returns the number of
    /// routes reached.
    pub fn dispatch(&self, event: &str, data: Value) -> usize {
        let mut delivered = 0;
        if let Some(mut routes) = self.routes.get_mut(event) {
            routes.retain(|route| {
                let ok = route.tx.send(data.clone()).is_ok();
                if ok {
                    delivered += 1;
                }
                ok && !route.once
            });
        }
        self.routes.remove_if(event, |_, routes| routes.is_empty());
        delivered
    }

    pub fn route_count(&self, event: &str) -> usize {
        self.routes.get(event).map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_once_route_fires_once() {
        let router = InboundRouter::new();
        let mut once = router.subscribe("response.1", true);
        let mut persistent = router.subscribe("response.1", false);

        assert_eq!(router.dispatch("response.1", json!(1)), 2);
        assert_eq!(router.dispatch("response.1", json!(2)), 1);

        assert_eq!(once.rx.recv().await, Some(json!(1)));
        assert_eq!(persistent.rx.recv().await, Some(json!(1)));
        assert_eq!(persistent.rx.recv().await, Some(json!(2)));
        assert_eq!(once.rx.recv().await, None);
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let router = InboundRouter::new();
        let handle = router.subscribe("publication.orders", false);
        drop(handle);

        assert_eq!(router.dispatch("publication.orders", json!({})), 0);
        assert_eq!(router.route_count("publication.orders"), 0);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_route() {
        let router = InboundRouter::new();
        let a = router.subscribe("AUTH_SUCCESS", false);
        let _b = router.subscribe("AUTH_SUCCESS", false);

        router.unsubscribe("AUTH_SUCCESS", a.id);
        assert_eq!(router.route_count("AUTH_SUCCESS"), 1);
    }
}
