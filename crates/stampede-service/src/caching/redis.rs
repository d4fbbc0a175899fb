//! A [`CacheStore`] backed by Redis, or anything speaking its protocol.
//!
//! Commands used:
//!
//! - `GET key` for cache reads.
//! - `SET key payload PX ttl` for cache writes.
//! - `SET lock_key token NX PX ttl` to acquire a lock record.
//! - A compare-and-delete Lua script to release a lock record, so that a producer whose lock
//!   already expired can never delete the lock of the producer that came after it.
//! - `PUBLISH` / `SUBSCRIBE` for completion notifications.
//!
//! Every command is bounded by the configured operation timeout. Timeouts and transport errors
//! are reported as [`CoalesceError::StoreUnavailable`].

use std::fmt;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Cmd, FromRedisValue, Script};

use super::store::{CacheStore, Notifications};
use super::store_config::RedisStoreConfig;
use super::{CoalesceError, CoalesceResult};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    release_script: Script,
    operation_timeout: Duration,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &"<Client>")
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

/// Converts a duration into the milliseconds expected by `PX`, which rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisStore {
    /// Connects to the configured server.
    ///
    /// The connection is re-established transparently if it breaks later on. Commands issued
    /// while the server is unreachable fail with [`CoalesceError::StoreUnavailable`].
    pub async fn connect(config: &RedisStoreConfig) -> anyhow::Result<Self> {
        let client = Client::open(config.url.as_str()).context("invalid redis url")?;
        let connection = tokio::time::timeout(
            config.connect_timeout,
            ConnectionManager::new(client.clone()),
        )
        .await
        .context("timeout connecting to redis")?
        .context("failed to connect to redis")?;

        tracing::info!("Connected to redis cache store");

        Ok(Self {
            client,
            connection,
            release_script: Script::new(RELEASE_SCRIPT),
            operation_timeout: config.operation_timeout,
        })
    }

    /// Runs a single command, bounded by the operation timeout.
    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> CoalesceResult<T> {
        let mut connection = self.connection.clone();
        match tokio::time::timeout(self.operation_timeout, cmd.query_async(&mut connection)).await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CoalesceError::from_store_error(err)),
            Err(_) => Err(self.timeout_error()),
        }
    }

    fn timeout_error(&self) -> CoalesceError {
        tracing::warn!(timeout = ?self.operation_timeout, "Redis operation timed out");
        CoalesceError::StoreUnavailable(format!(
            "redis operation timed out after {:?}",
            self.operation_timeout
        ))
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> CoalesceResult<Option<Vec<u8>>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CoalesceResult<()> {
        let cmd = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .to_owned();
        self.query::<()>(&cmd).await
    }

    async fn try_acquire(
        &self,
        lock_key: &str,
        token: &str,
        ttl: Duration,
    ) -> CoalesceResult<bool> {
        let cmd = redis::cmd("SET")
            .arg(lock_key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .to_owned();
        // `OK` if the record was created, nil if it already existed
        let reply: Option<String> = self.query(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn release(&self, lock_key: &str, token: &str) -> CoalesceResult<bool> {
        let mut connection = self.connection.clone();
        let mut invocation = self.release_script.key(lock_key);
        invocation.arg(token);
        let future = invocation.invoke_async(&mut connection);
        let deleted: i64 = match tokio::time::timeout(self.operation_timeout, future).await {
            Ok(Ok(deleted)) => deleted,
            Ok(Err(err)) => return Err(CoalesceError::from_store_error(err)),
            Err(_) => return Err(self.timeout_error()),
        };
        Ok(deleted > 0)
    }

    async fn publish(&self, channel: &str) -> CoalesceResult<()> {
        let cmd = redis::cmd("PUBLISH").arg(channel).arg(1).to_owned();
        self.query::<i64>(&cmd).await.map(|_receivers| ())
    }

    async fn subscribe(&self, channel: &str) -> CoalesceResult<Option<Notifications>> {
        // subscriptions need a dedicated connection, the multiplexed one can not be used
        let future = async {
            let mut pubsub = self.client.get_async_pubsub().await?;
            pubsub.subscribe(channel).await?;
            Ok::<_, redis::RedisError>(pubsub)
        };
        let pubsub = match tokio::time::timeout(self.operation_timeout, future).await {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(err)) => return Err(CoalesceError::from_store_error(err)),
            Err(_) => return Err(self.timeout_error()),
        };

        let stream = pubsub.into_on_message().map(|_message| ());
        Ok(Some(Box::pin(stream)))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
