//! Message definitions for the broker
//!
//! `Message` is the canonical wire/internal representation. It is serialized
//! to JSON both for broadcast channels and for the point-to-point lists in
//! the backing store, so every field must survive a round trip unchanged.
//!
//! Notes on fields:
//! - `id`: UUID generated at creation, never reused
//! - `payload`: caller-defined JSON tree
//! - `timestamp`: seconds since UNIX epoch with sub-second precision
//! - `priority`: integer 1..=4 on the wire (LOW..CRITICAL)
//! - `retry_count`/`max_retries`: a message with `retry_count > max_retries`
//!   only ever lives in the dead-letter queue
//! - `delivery_mode`: `"pub_sub"` or `"point_to_point"`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_SOURCE: &str = "eventcore";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// Tiers in consumption order, highest first.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Segment used in the `queue:{tier}:{event_type}` list name.
    pub fn tier(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "default",
            Priority::Low => "low",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "1" => Ok(Priority::Low),
            "normal" | "default" | "2" => Ok(Priority::Normal),
            "high" | "3" => Ok(Priority::High),
            "critical" | "4" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    PubSub,
    PointToPoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: f64,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub delivery_mode: DeliveryMode,
    pub correlation_id: String,
    pub source: String,
}

impl Message {
    /// Build a fresh message stamped with a new id and the current time.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            timestamp: now_secs(),
            priority: Priority::Normal,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            delivery_mode: DeliveryMode::PubSub,
            correlation_id: Uuid::new_v4().to_string(),
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Copy of this message with `retry_count` bumped by one.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

/// Seconds since the UNIX epoch as a float.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn channel_name(event_type: &str) -> String {
    format!("channel:{event_type}")
}

pub fn queue_name(event_type: &str, priority: Priority) -> String {
    format!("queue:{}:{event_type}", priority.tier())
}

pub fn dead_letter_name(event_type: &str) -> String {
    format!("dlq:{event_type}")
}
