//! Envelope codec
//!
//! The session layer treats the codec as an opaque bijection between
//! envelopes and text frames. `JsonCodec` is the stock implementation;
//! dates travel as `{"$date": <unix millis>}` so they survive the trip.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};

use crate::message::Envelope;

const DATE_KEY: &str = "$date";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// Encode/decode envelopes to text frames
pub trait Codec: Send + Sync + std::fmt::Debug {
    fn encode(&self, envelope: &Envelope) -> Result<String, CodecError>;
    fn decode(&self, text: &str) -> Result<Envelope, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<String, CodecError> {
        Ok(serde_json::to_string(envelope)?)
    }

    fn decode(&self, text: &str) -> Result<Envelope, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(CodecError::InvalidEnvelope(format!(
                "expected object, got {}",
                text.chars().take(32).collect::<String>()
            )));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Wrap a timestamp in the extended date form
pub fn encode_date(date: &DateTime<Utc>) -> Value {
    json!({ DATE_KEY: date.timestamp_millis() })
}

/// Read a timestamp from the extended date form
pub fn decode_date(value: &Value) -> Option<DateTime<Utc>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let millis = obj.get(DATE_KEY)?.as_i64()?;
    Utc.timestamp_millis_opt(millis).single()
}
