use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::{DeliveryMode, Priority};

/// One entry of `Publisher::batch_publish`. Unset fields fall back to the
/// batch-wide defaults (NORMAL priority, pub/sub).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub event_type: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub delivery_mode: Option<DeliveryMode>,
}

impl BatchEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            priority: None,
            delivery_mode: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = Some(mode);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchError {
    pub index: usize,
    pub event_type: String,
    pub error: String,
}

/// Outcome of a batch. `total` is the size of the batch, so with
/// `continue_on_error = false` `success + failed` can be smaller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<BatchError>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.success == self.total
    }
}
