//! Tagged RPC error value
//!
//! Servers answer a failed call with an error object carrying
//! `"_isRpcError": true`. The client also synthesizes this shape locally
//! for timeouts and interrupted connections so every terminal failure of
//! a call has one representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire tag identifying an error response
pub const RPC_ERROR_TAG: &str = "_isRpcError";

/// Request did not complete within its window
pub const TIMEOUT_CODE: i64 = 408;

/// Connection dropped while the call was in flight
pub const CONNECTION_INTERRUPTED_CODE: i64 = 1;

/// Error value returned by the server (or synthesized by the client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(into = "RpcErrorWire", try_from = "RpcErrorWire")]
#[error("[{code}] {error}")]
pub struct RpcError {
    pub code: i64,
    pub error: String,
    pub description: Option<String>,
}

impl RpcError {
    pub fn new(code: i64, error: impl Into<String>) -> Self {
        Self {
            code,
            error: error.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// `408 Request Timeout: <endpoint>`
    pub fn timeout(endpoint: &str) -> Self {
        Self::new(TIMEOUT_CODE, format!("Request Timeout: {}", endpoint))
    }

    pub fn connection_interrupted() -> Self {
        Self::new(CONNECTION_INTERRUPTED_CODE, "Connection Interrupted")
    }

    pub fn is_timeout(&self) -> bool {
        self.code == TIMEOUT_CODE
    }

    /// Check whether a response payload is a tagged error
    pub fn is_rpc_error(value: &Value) -> bool {
        value.get(RPC_ERROR_TAG).and_then(Value::as_bool) == Some(true)
    }

    /// Extract a tagged error from a response payload
    pub fn from_value(value: &Value) -> Option<Self> {
        if !Self::is_rpc_error(value) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Serialize, Deserialize)]
struct RpcErrorWire {
    #[serde(rename = "_isRpcError")]
    tag: bool,
    code: i64,
    error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl From<RpcError> for RpcErrorWire {
    fn from(e: RpcError) -> Self {
        Self {
            tag: true,
            code: e.code,
            error: e.error,
            description: e.description,
        }
    }
}

impl TryFrom<RpcErrorWire> for RpcError {
    type Error = String;

    fn try_from(wire: RpcErrorWire) -> Result<Self, Self::Error> {
        if !wire.tag {
            return Err(format!("{} must be true", RPC_ERROR_TAG));
        }
        Ok(Self {
            code: wire.code,
            error: wire.error,
            description: wire.description,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape_carries_tag() {
        let value = RpcError::new(403, "Forbidden").to_value();
        assert_eq!(
            value,
            json!({"_isRpcError": true, "code": 403, "error": "Forbidden"})
        );
        assert!(RpcError::is_rpc_error(&value));
    }

    #[test]
    fn test_plain_values_are_not_errors() {
        assert!(!RpcError::is_rpc_error(&json!({"code": 1, "error": "x"})));
        assert!(!RpcError::is_rpc_error(&json!("text")));
        assert!(!RpcError::is_rpc_error(&json!({"_isRpcError": false})));
        assert!(RpcError::from_value(&json!(null)).is_none());
    }

    #[test]
    fn test_from_value_keeps_description() {
        let value = json!({
            "_isRpcError": true,
            "code": 500,
            "error": "Internal",
            "description": "db unavailable"
        });
        let err = RpcError::from_value(&value).unwrap();
        assert_eq!(err.code, 500);
        assert_eq!(err.description.as_deref(), Some("db unavailable"));
    }

    #[test]
    fn test_timeout_message_names_endpoint() {
        let err = RpcError::timeout("orders.create");
        assert!(err.is_timeout());
        assert_eq!(err.error, "Request Timeout: orders.create");
    }
}
