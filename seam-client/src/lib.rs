//! Seam Client - RPC session layer for Seamless servers
//!
//! Keeps one logical session alive over a WebSocket link, falling back to
//! an HTTP polling link when the socket keeps failing. Outbound requests
//! queue in an outbox until the session is connected (and logged in, when
//! they need it). On top of that sit request/response calls, mutations
//! with side effects and streams, and topic subscriptions.

pub mod auth;
pub mod call;
pub mod config;
pub mod error;
pub mod link;
pub mod mutation;
pub mod outbox;
pub mod router;
pub mod session;
pub mod stream;
pub mod subscription;
pub mod transport;
pub mod types;

mod util;

pub use auth::{AuthExtension, AuthFailure, AuthFailureKind, AuthGate, AuthStatus, AutoLogin};
pub use call::{ActiveCall, Call};
pub use config::SessionConfig;
pub use error::{CallFailure, ClientError, ClientResult, MutationError};
pub use link::{
    Connector, HttpConnector, HttpStatusProbe, Link, LinkEvent, MemoryServer, Probe,
    WebSocketConnector,
};
pub use mutation::{Endpoint, Mutation, MutationOutput, MutationSnapshot, SideEffectQuery};
pub use outbox::PendingRequest;
pub use session::{Session, SessionBuilder};
pub use stream::StreamHandle;
pub use subscription::{Subscription, TopicListener};
pub use transport::Transport;
pub use types::{StatusChange, TransportKind, TransportStatus};

// Re-export shared wire types for convenience
pub use shared::{Envelope, RpcError};
