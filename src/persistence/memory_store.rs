//! In-process backing store.
//!
//! Lists live in a `HashMap<String, VecDeque<String>>` behind an async
//! mutex and channels go through a shared `ChannelHub`. Availability can be
//! switched off to simulate a transport outage: while unavailable every
//! operation, `reconnect` included, fails with `StoreError::Connection`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ChannelHub, ChannelSubscription, Store};
use crate::utils::StoreError;

#[derive(Debug)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    hub: ChannelHub,
    available: AtomicBool,
    reconnects: AtomicUsize,
}

impl MemoryStore {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            hub: ChannelHub::new(channel_capacity),
            available: AtomicBool::new(true),
            reconnects: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `reconnect` calls seen so far.
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Connection("memory store unavailable".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(super::DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn publish(&self, channel: &str, data: &str) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self.hub.publish(channel, data))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<ChannelSubscription, StoreError> {
        self.check()?;
        Ok(self.hub.subscribe(channels))
    }

    async fn push(&self, key: &str, data: &str) -> Result<usize, StoreError> {
        self.check()?;
        let mut lists = self.lists.lock().await;
        let list = lists.entry(key.to_string()).or_default();
        list.push_back(data.to_string());
        Ok(list.len())
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let mut lists = self.lists.lock().await;
        let Some(list) = lists.get_mut(key) else {
            return Ok(None);
        };
        let item = list.pop_front();
        if list.is_empty() {
            lists.remove(key);
        }
        Ok(item)
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self.lists.lock().await.get(key).map_or(0, VecDeque::len))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.lists.lock().await.remove(key).is_some())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        Ok(self
            .lists
            .lock()
            .await
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }
}
