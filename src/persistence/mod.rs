//! The `persistence` module defines the backing store the broker talks to.
//!
//! The broker only needs a small capability set: broadcast channels for
//! pub/sub delivery and FIFO lists for point-to-point queues. `Store`
//! captures that set so the broker can run against the in-process
//! `MemoryStore` or the on-disk `SledStore` without changes.

pub mod memory_store;
pub mod sled_store;

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::utils::StoreError;

pub use memory_store::MemoryStore;
pub use sled_store::SledStore;

/// Default buffer capacity for broadcast channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Re-establish the underlying connection.
    async fn reconnect(&self) -> Result<(), StoreError>;

    /// Broadcast `data` on `channel`. Returns the number of receivers.
    async fn publish(&self, channel: &str, data: &str) -> Result<usize, StoreError>;

    async fn subscribe(&self, channels: &[String]) -> Result<ChannelSubscription, StoreError>;

    /// Append to the tail of a list. Returns the new length.
    async fn push(&self, key: &str, data: &str) -> Result<usize, StoreError>;

    /// Remove and return the head of a list.
    async fn pop(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn len(&self, key: &str) -> Result<usize, StoreError>;

    /// Drop a list. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Read a whole list without removing anything.
    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct Published {
    pub channel: String,
    pub data: String,
}

/// In-process fan-out shared by both store implementations.
#[derive(Debug, Clone)]
pub struct ChannelHub {
    sender: broadcast::Sender<Published>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, channel: &str, data: &str) -> usize {
        // A send error only means there are no receivers right now.
        self.sender
            .send(Published {
                channel: channel.to_string(),
                data: data.to_string(),
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self, channels: &[String]) -> ChannelSubscription {
        ChannelSubscription {
            rx: self.sender.subscribe(),
            channels: channels.iter().cloned().collect(),
        }
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// A live subscription to a set of broadcast channels.
#[derive(Debug)]
pub struct ChannelSubscription {
    rx: broadcast::Receiver<Published>,
    channels: HashSet<String>,
}

impl ChannelSubscription {
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    /// Replace the channel filter without dropping the receiver, so messages
    /// already buffered for channels that stay subscribed are kept.
    pub fn set_channels(&mut self, channels: &[String]) {
        self.channels = channels.iter().cloned().collect();
    }

    /// Wait for the next message on one of the subscribed channels.
    ///
    /// Fails with `StoreError::Closed` once the store side has gone away.
    pub async fn recv(&mut self) -> Result<Published, StoreError> {
        loop {
            match self.rx.recv().await {
                Ok(published) if self.channels.contains(&published.channel) => {
                    return Ok(published);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "channel subscription lagged, messages dropped");
                }
                Err(RecvError::Closed) => return Err(StoreError::Closed),
            }
        }
    }
}
