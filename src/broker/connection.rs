//! Scoped access to the shared backing store.
//!
//! Every store operation goes through `with_connection!`: the store is pinged
//! first (reconnecting once if that fails), the operation runs, and a
//! connection error from the operation triggers one reconnect and one retry.
//! Reconnects are serialized behind a single gate and counted by an epoch, so
//! callers that saw the same failure wait for one reconnect instead of
//! racing their own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::persistence::Store;
use crate::utils::StoreError;

pub struct Connection {
    store: Arc<dyn Store>,
    reconnect_gate: Mutex<()>,
    epoch: AtomicU64,
}

impl Connection {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            reconnect_gate: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Number of successful reconnects so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Ping, and reconnect once if the ping fails.
    pub async fn acquire(&self) -> Result<&dyn Store, StoreError> {
        let seen = self.epoch();
        if let Err(err) = self.store.ping().await {
            tracing::warn!(error = %err, "store ping failed, reconnecting");
            return self.reconnect(seen).await;
        }
        Ok(self.store.as_ref())
    }

    /// Reconnect after a failure observed at epoch `seen`. If another caller
    /// already reconnected since then, the store is handed back as is.
    pub async fn reconnect(&self, seen: u64) -> Result<&dyn Store, StoreError> {
        let _gate = self.reconnect_gate.lock().await;
        if self.epoch() != seen {
            return Ok(self.store.as_ref());
        }
        self.store.reconnect().await.inspect_err(|err| {
            tracing::error!(error = %err, "store reconnect failed");
        })?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(epoch, "store reconnected");
        Ok(self.store.as_ref())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}

/// Run a store operation with ping-first acquisition and a single
/// reconnect-and-retry on connection errors.
///
/// `with_connection!(conn, |store| store.push(&key, &data))`
macro_rules! with_connection {
    ($conn:expr, |$store:ident| $op:expr) => {{
        match $conn.acquire().await {
            Err(err) => Err(err),
            Ok($store) => {
                let seen = $conn.epoch();
                match $op.await {
                    Err(err) if err.is_connection() => {
                        tracing::warn!(error = %err, "store operation failed, retrying after reconnect");
                        match $conn.reconnect(seen).await {
                            Ok($store) => $op.await,
                            Err(err) => Err(err),
                        }
                    }
                    other => other,
                }
            }
        }
    }};
}

pub(crate) use with_connection;
