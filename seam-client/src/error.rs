//! Client error types

use shared::{CodecError, RpcError};
use thiserror::Error;

/// Client error type
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket link failed
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Link could not be opened or used
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation needs a connected transport
    #[error("Not connected")]
    NotConnected,

    /// API misuse (double invoke, connect on a live link)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Server rejected a request
    #[error("RPC error: {0}")]
    Rpc(RpcError),

    /// Mutation failed
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// Session has been closed
    #[error("Session closed")]
    Closed,
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Terminal failure of a single call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFailure {
    /// No terminal response within the call window
    #[error("Request Timeout: {endpoint}")]
    Timeout { endpoint: String },

    /// Error response from the server, or a locally synthesized
    /// interruption when the connection dropped
    #[error("{0}")]
    Rejected(RpcError),
}

impl CallFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::Timeout { endpoint } => RpcError::timeout(endpoint),
            Self::Rejected(e) => e.clone(),
        }
    }
}

/// Failure surfaced by a mutation
///
/// Timeouts pass through as-is so callers can special-case them; every
/// other failure carries the endpoint it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("Request Timeout: {endpoint}")]
    Timeout { endpoint: String },

    #[error("{endpoint}: {error}")]
    Failed { endpoint: String, error: RpcError },
}

impl MutationError {
    pub fn from_failure(endpoint: &str, failure: CallFailure) -> Self {
        match failure {
            CallFailure::Timeout { endpoint } => Self::Timeout { endpoint },
            CallFailure::Rejected(error) => Self::Failed {
                endpoint: endpoint.to_string(),
                error,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::Timeout { endpoint } | Self::Failed { endpoint, .. } => endpoint,
        }
    }

    /// Numeric code (408 for timeouts)
    pub fn code(&self) -> i64 {
        match self {
            Self::Timeout { .. } => shared::error::TIMEOUT_CODE,
            Self::Failed { error, .. } => error.code,
        }
    }
}
