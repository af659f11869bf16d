pub mod connection;
pub mod engine;
pub mod message;
pub mod retry;
pub mod topic;

pub use engine::{Broker, HealthStatus, PublishOptions};
pub use message::{DeliveryMode, Message, Priority};
pub use retry::RetryPolicy;
pub use topic::{Handler, SharedHandler, SubscriptionId};
