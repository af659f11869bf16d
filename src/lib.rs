//! # eventcore
//!
//! `eventcore` is an in-process event-messaging core. It delivers events
//! either by broadcast (publish/subscribe) or through priority-tiered work
//! queues (point-to-point) with retry, exponential backoff and a
//! dead-letter queue.
//!
//! ## Core Modules
//!
//! - `broker`: messages, the pub/sub dispatch table and listening loop,
//!   point-to-point consumption and the retry/dead-letter policy.
//! - `publisher`: the envelope, publish variants, batch publishing and
//!   post-call event triggers.
//! - `subscriber`: subscriptions, per-subscription consumption loops and the
//!   worker pool that runs handlers.
//! - `persistence`: the `Store` capability trait with an in-memory and a
//!   sled-backed implementation.
//! - `config`: layered settings from file and environment.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod publisher;
pub mod subscriber;
pub mod utils;

pub use broker::{Broker, DeliveryMode, Message, Priority, PublishOptions};
pub use publisher::Publisher;
pub use subscriber::{SubscribeOptions, Subscriber};
pub use utils::HandlerResult;
