//! Topic management
//!
//! A `Topic` holds the pub/sub handlers registered for one event type, in
//! registration order. Dispatch walks them in that order.
//!
//! Concurrency note: callers must synchronize access to `Topic` (the broker
//! keeps all topics behind one `RwLock`) and must not invoke handlers while
//! holding that lock; `handlers()` hands out clones for that reason.

use std::sync::Arc;

use crate::broker::message::Message;
use crate::utils::HandlerResult;

pub type SubscriptionId = String;

/// Caller-supplied logic invoked for each delivered message.
///
/// Any `Fn(&Message) -> HandlerResult` closure is a handler.
///
/// Handlers are synchronous and may block. Pub/sub handlers are called one
/// after another on the blocking thread pool, point-to-point handlers on the
/// subscriber's worker pool, so neither stalls the async runtime.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: &Message) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) -> HandlerResult {
        self(message)
    }
}

pub type SharedHandler = Arc<dyn Handler>;

#[derive(Default)]
pub struct Topic {
    pub name: String,
    handlers: Vec<(SubscriptionId, SharedHandler)>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handlers: Vec::new(),
        }
    }

    /// Append a handler. Re-using an id replaces nothing; ids are unique.
    pub fn subscribe(&mut self, id: SubscriptionId, handler: SharedHandler) {
        self.handlers.push((id, handler));
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(existing, _)| existing != id);
        self.handlers.len() != before
    }

    pub fn handlers(&self) -> Vec<(SubscriptionId, SharedHandler)> {
        self.handlers.clone()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
