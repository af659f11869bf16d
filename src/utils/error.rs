//! Error types used within `eventcore`.
//!
//! Public broker and publisher operations never return these across their
//! boundary: they are logged and folded into a `bool`/`Option` result. They
//! exist so the internals can use `?` and so the reason for a failure ends
//! up in the logs.

use thiserror::Error;

/// Outcome of a user handler. `Ok(false)` and `Err(_)` both count as a
/// failed delivery and feed the retry policy.
pub type HandlerResult = anyhow::Result<bool>;

/// Failures raised by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient transport failure; eligible for reconnect-and-retry.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("store is closed")]
    Closed,
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(e) => Self::Connection(e.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Malformed message on the wire. Dropped, never retried.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of a job submitted to the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("job did not finish within {0:?}")]
    TimedOut(std::time::Duration),
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("worker pool is shut down")]
    ShutDown,
}
