//! Canonical outbound envelope.
//!
//! Every payload sent through `Publisher::publish` is wrapped as
//! `{ "data": ..., "published_at": ..., "version": "1.0", "metadata"?: ... }`
//! so consumers can tell when and under which format version it was sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::message::now_secs;

pub const ENVELOPE_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: Value,
    pub published_at: f64,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Envelope {
    pub fn new(data: Value, metadata: Option<Value>) -> Self {
        Self {
            data,
            published_at: now_secs(),
            version: ENVELOPE_VERSION.to_string(),
            metadata,
        }
    }

    /// Read an envelope back out of a received payload. `None` if the
    /// payload was not published through `Publisher`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    pub fn into_value(self) -> Value {
        // only fails for non-string map keys, which `Value` cannot hold
        serde_json::to_value(&self).unwrap_or(Value::Null)
    }
}
