use serde::Deserialize;

use crate::broker::message::DEFAULT_MAX_RETRIES;
use crate::persistence::DEFAULT_CHANNEL_CAPACITY;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Settings {
    pub store: StoreSettings,
    pub broker: BrokerSettings,
    pub consumer: ConsumerSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sled,
}

/// Which backing store to open and where.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub path: String,
    pub channel_capacity: usize,
}

/// Retry policy and polling for the broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub default_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub poll_interval_ms: u64,
}

/// Point-to-point consumption loops and the worker pool behind them.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub workers: usize,
    pub consume_timeout_ms: u64,
    pub handler_timeout_ms: u64,
    pub idle_wait_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled
/// from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub store: Option<PartialStoreSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStoreSettings {
    pub backend: Option<StoreBackend>,
    pub path: Option<String>,
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub default_max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub workers: Option<usize>,
    pub consume_timeout_ms: Option<u64>,
    pub handler_timeout_ms: Option<u64>,
    pub idle_wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: "eventcore_db".to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            poll_interval_ms: 100,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            consume_timeout_ms: 5_000,
            handler_timeout_ms: 60_000,
            idle_wait_ms: 100,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from the defaults.
    pub fn merge(self) -> Settings {
        let default = Settings::default();
        let store = self.store.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let consumer = self.consumer.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            store: StoreSettings {
                backend: store.backend.unwrap_or(default.store.backend),
                path: store.path.unwrap_or(default.store.path),
                channel_capacity: store
                    .channel_capacity
                    .unwrap_or(default.store.channel_capacity),
            },
            broker: BrokerSettings {
                default_max_retries: broker
                    .default_max_retries
                    .unwrap_or(default.broker.default_max_retries),
                retry_base_delay_ms: broker
                    .retry_base_delay_ms
                    .unwrap_or(default.broker.retry_base_delay_ms),
                retry_max_delay_ms: broker
                    .retry_max_delay_ms
                    .unwrap_or(default.broker.retry_max_delay_ms),
                poll_interval_ms: broker
                    .poll_interval_ms
                    .unwrap_or(default.broker.poll_interval_ms),
            },
            consumer: ConsumerSettings {
                workers: consumer.workers.unwrap_or(default.consumer.workers),
                consume_timeout_ms: consumer
                    .consume_timeout_ms
                    .unwrap_or(default.consumer.consume_timeout_ms),
                handler_timeout_ms: consumer
                    .handler_timeout_ms
                    .unwrap_or(default.consumer.handler_timeout_ms),
                idle_wait_ms: consumer
                    .idle_wait_ms
                    .unwrap_or(default.consumer.idle_wait_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}
