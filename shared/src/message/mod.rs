//! Message envelope and event routing names
//!
//! Every frame on the wire is a JSON object `{ "event": string, "data": any }`.
//!
//! ```text
//! client → server                     server → client
//! ───────────────                     ───────────────
//! ping / pong                         ping / pong
//! call                                response.<callId>
//! SUBSCRIBE_TO_TOPIC                  response.<callId>.<streamId>
//! PUBLISH_TO_TOPIC                    publication.<topic>
//! AUTH_LOGIN                          subscription-result.<topic>
//!                                     AUTH_SUCCESS / AUTH_ERROR
//! ```

mod payload;

pub use payload::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event names
// ============================================================================

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const CALL: &str = "call";
pub const SUBSCRIBE_TO_TOPIC: &str = "SUBSCRIBE_TO_TOPIC";
pub const PUBLISH_TO_TOPIC: &str = "PUBLISH_TO_TOPIC";
pub const AUTH_LOGIN: &str = "AUTH_LOGIN";
pub const AUTH_SUCCESS: &str = "AUTH_SUCCESS";
pub const AUTH_ERROR: &str = "AUTH_ERROR";

const RESPONSE_PREFIX: &str = "response.";
const PUBLICATION_PREFIX: &str = "publication.";
const SUBSCRIPTION_RESULT_PREFIX: &str = "subscription-result.";

pub fn response_event(call_id: &str) -> String {
    format!("{}{}", RESPONSE_PREFIX, call_id)
}

pub fn stream_event(call_id: &str, stream_id: &str) -> String {
    format!("{}{}.{}", RESPONSE_PREFIX, call_id, stream_id)
}

pub fn publication_event(topic: &str) -> String {
    format!("{}{}", PUBLICATION_PREFIX, topic)
}

pub fn subscription_result_event(topic: &str) -> String {
    format!("{}{}", SUBSCRIPTION_RESULT_PREFIX, topic)
}

// ============================================================================
// Envelope
// ============================================================================

/// A single frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn ping() -> Self {
        Self::new(PING, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(PONG, Value::Null)
    }

    /// Build an envelope from a serializable payload
    pub fn with_payload<T: Serialize>(
        event: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event, serde_json::to_value(payload)?))
    }

    /// Parse the `data` field into a typed payload
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    pub fn kind(&self) -> ServerEvent {
        ServerEvent::parse(&self.event)
    }
}

// ============================================================================
// Inbound classification
// ============================================================================

/// Inbound event name, classified for routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Ping,
    Pong,
    Response { call_id: String },
    StreamChunk { call_id: String, stream_id: String },
    Publication { topic: String },
    SubscriptionResult { topic: String },
    AuthSuccess,
    AuthError,
    Other(String),
}

impl ServerEvent {
    /// Call ids never contain dots, so the first dot after the prefix
    /// separates the stream id. Topic names are taken verbatim.
    pub fn parse(event: &str) -> Self {
        match event {
            PING => return Self::Ping,
            PONG => return Self::Pong,
            AUTH_SUCCESS => return Self::AuthSuccess,
            AUTH_ERROR => return Self::AuthError,
            _ => {}
        }

        if let Some(rest) = event.strip_prefix(RESPONSE_PREFIX) {
            return match rest.split_once('.') {
                Some((call_id, stream_id)) => Self::StreamChunk {
                    call_id: call_id.to_string(),
                    stream_id: stream_id.to_string(),
                },
                None => Self::Response {
                    call_id: rest.to_string(),
                },
            };
        }
        if let Some(topic) = event.strip_prefix(PUBLICATION_PREFIX) {
            return Self::Publication {
                topic: topic.to_string(),
            };
        }
        if let Some(topic) = event.strip_prefix(SUBSCRIPTION_RESULT_PREFIX) {
            return Self::SubscriptionResult {
                topic: topic.to_string(),
            };
        }
        Self::Other(event.to_string())
    }
}
