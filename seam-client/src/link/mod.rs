//! Byte-level links beneath a [`Transport`](crate::transport::Transport)
//!
//! A [`Connector`] opens one physical link per connection attempt and
//! hands back the sending half plus a stream of [`LinkEvent`]s:
//!
//! ```text
//!   Connector::open ──► (Arc<dyn Link>, UnboundedReceiver<LinkEvent>)
//!                           │                   │
//!                      send(text)        Open / Message / Error / Close
//!                      close(code)
//! ```
//!
//! Implementations:
//! - [`WebSocketConnector`]: WebSocket (primary)
//! - [`HttpConnector`]: signed HTTP with inbox polling (fallback)
//! - [`MemoryConnector`]: in-process, for tests and demos

mod http;
mod memory;
mod probe;
mod websocket;

pub use http::HttpConnector;
pub use memory::{MemoryConnection, MemoryConnector, MemoryServer};
pub use probe::{HttpStatusProbe, Probe};
pub use websocket::WebSocketConnector;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ClientResult;
use crate::types::TransportKind;

/// Abnormal closure, used when the peer vanished without a close frame
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Event surfaced by a link. Each connection attempt yields at most one
/// terminal `Error` or `Close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Open,
    Message(String),
    Error(String),
    Close { code: u16, reason: String },
}

/// Sending half of an open link
#[async_trait]
pub trait Link: Send + Sync + std::fmt::Debug {
    async fn send(&self, text: String) -> ClientResult<()>;
    fn close(&self, code: u16, reason: &str);
}

/// Opens links of one transport kind
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> TransportKind;

    fn open(
        &self,
        base_url: &str,
    ) -> ClientResult<(Arc<dyn Link>, mpsc::UnboundedReceiver<LinkEvent>)>;
}
