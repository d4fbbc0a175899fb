use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::redis::RedisStore;
use super::store::{InMemoryStore, StoreRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// URL of the server, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,

    /// Upper bound for establishing the initial connection.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for every single command.
    ///
    /// A command exceeding it fails with `StoreUnavailable`. This should be well below the
    /// poll interval, otherwise a slow store directly slows down every waiter.
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(1)
}

/// The store all coordination goes through.
///
/// All processes that should coalesce their computations must be configured with the same
/// store. The kind of store is selected with the `type` key:
///
/// ```yaml
/// store:
///   type: redis
///   url: "redis://cache.internal:6379/0"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// A store local to this process, which only coalesces within this process.
    #[default]
    Memory,
    /// A Redis server shared between processes and hosts.
    Redis(RedisStoreConfig),
}

impl StoreConfig {
    /// Creates the configured store.
    pub async fn connect(&self) -> anyhow::Result<StoreRef> {
        let store: StoreRef = match self {
            Self::Memory => {
                tracing::warn!("Using an in-memory cache store, coalescing is process-local");
                Arc::new(InMemoryStore::new())
            }
            Self::Redis(config) => Arc::new(RedisStore::connect(config).await?),
        };
        Ok(store)
    }
}
