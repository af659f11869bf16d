use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::broker::{DeliveryMode, Priority, SharedHandler, SubscriptionId};

/// How a subscription wants its messages delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub delivery_mode: DeliveryMode,
    /// Only meaningful for point-to-point consumption.
    pub priority: Priority,
}

impl SubscribeOptions {
    pub fn pub_sub() -> Self {
        Self::default()
    }

    pub fn point_to_point() -> Self {
        Self {
            delivery_mode: DeliveryMode::PointToPoint,
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// One registered handler.
///
/// Pub/sub subscriptions live in the broker's dispatch table; point-to-point
/// subscriptions each drive their own consumption loop.
pub struct Subscription {
    pub id: SubscriptionId,
    pub event_type: String,
    pub handler: SharedHandler,
    pub delivery_mode: DeliveryMode,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        event_type: &str,
        handler: SharedHandler,
        options: SubscribeOptions,
    ) -> Self {
        Self {
            id,
            event_type: event_type.to_string(),
            handler,
            delivery_mode: options.delivery_mode,
            priority: options.priority,
            created_at: Utc::now(),
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_point_to_point(&self) -> bool {
        self.delivery_mode == DeliveryMode::PointToPoint
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("delivery_mode", &self.delivery_mode)
            .field("priority", &self.priority)
            .field("active", &self.is_active())
            .field("created_at", &self.created_at)
            .finish()
    }
}
