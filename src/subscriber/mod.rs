pub mod manager;
pub mod pool;
pub mod subscription;

pub use manager::{Subscriber, SubscriberStats};
pub use pool::WorkerPool;
pub use subscription::{SubscribeOptions, Subscription};

#[cfg(test)]
mod tests;
