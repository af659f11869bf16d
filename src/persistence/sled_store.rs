//! Backing store on top of `sled`
//!
//! Every list is its own sled tree. Entries are keyed by a big-endian id
//! from `Db::generate_id`, which is monotonic, so iteration order is push
//! order and `pop_min` takes the head. Queued point-to-point messages
//! therefore survive a restart.
//!
//! Broadcast channels are not persisted: they fan out in-process through a
//! `ChannelHub`, matching the fire-and-forget contract of pub/sub.

use async_trait::async_trait;
use sled::Db;

use super::{ChannelHub, ChannelSubscription, Store};
use crate::utils::StoreError;

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    hub: ChannelHub,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str, channel_capacity: usize) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            hub: ChannelHub::new(channel_capacity),
        })
    }

    fn tree(&self, key: &str) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(key)?)
    }
}

fn decode(bytes: sled::IVec) -> Result<String, StoreError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl Store for SledStore {
    async fn ping(&self) -> Result<(), StoreError> {
        // fails once the db has hit an unrecoverable io error
        self.db.contains_key(b"__ping__")?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, data: &str) -> Result<usize, StoreError> {
        Ok(self.hub.publish(channel, data))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<ChannelSubscription, StoreError> {
        Ok(self.hub.subscribe(channels))
    }

    async fn push(&self, key: &str, data: &str) -> Result<usize, StoreError> {
        let tree = self.tree(key)?;
        let id = self.db.generate_id()?;
        tree.insert(id.to_be_bytes(), data.as_bytes())?;
        Ok(tree.len())
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let tree = self.tree(key)?;
        match tree.pop_min()? {
            Some((_, value)) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.tree(key)?.len())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.db.drop_tree(key)?)
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.tree(key)?
            .iter()
            .values()
            .map(|value| decode(value?))
            .collect()
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
