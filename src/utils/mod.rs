//! The `utils` module provides shared definitions used across `eventcore`.
//!
//! It centralizes the error taxonomy and the logging bootstrap so every
//! component reports failures and diagnostics the same way.

pub mod error;
pub mod logging;

pub use error::{BrokerError, HandlerResult, PoolError, StoreError};
