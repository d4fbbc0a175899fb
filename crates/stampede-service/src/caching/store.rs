//! The shared key-value store all coordination goes through.
//!
//! The coordinator needs only a handful of primitives from the store: plain reads and writes
//! with an expiration, an atomic "set if absent" for lock records, and a compare-and-delete to
//! release them. Optionally, a store can offer publish/subscribe so that waiters are woken up
//! instead of having to poll.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{CoalesceError, CoalesceResult};

/// A stream of notifications for one channel.
///
/// Every item means "something changed", the payload is irrelevant. Notifications may be
/// lost, subscribers must not rely on them for correctness.
pub type Notifications = BoxStream<'static, ()>;

/// A shared reference to a store.
pub type StoreRef = Arc<dyn CacheStore>;

/// A network-accessible key-value store shared by all coordinating processes.
///
/// Every operation may fail with [`CoalesceError::StoreUnavailable`]. Implementations must not
/// report a failure to reach the store as a miss, or as a lock that is held by someone else.
#[async_trait]
pub trait CacheStore: fmt::Debug + Send + Sync + 'static {
    /// Reads the value stored under `key`.
    ///
    /// Returns `None` if there is no value, or if it has expired.
    async fn get(&self, key: &str) -> CoalesceResult<Option<Vec<u8>>>;

    /// Unconditionally writes `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CoalesceResult<()>;

    /// Atomically creates a lock record holding `token` if none exists.
    ///
    /// Returns `true` iff this call created the record.
    async fn try_acquire(
        &self,
        lock_key: &str,
        token: &str,
        ttl: Duration,
    ) -> CoalesceResult<bool>;

    /// Deletes the lock record, but only if it still holds `token`.
    ///
    /// Returns `true` if a record was deleted. Releasing a record that has expired, or that
    /// was re-acquired by another owner in the meantime, is not an error.
    async fn release(&self, lock_key: &str, token: &str) -> CoalesceResult<bool>;

    /// Announces a change on `channel` to all subscribers.
    ///
    /// Stores without publish/subscribe support silently do nothing.
    async fn publish(&self, _channel: &str) -> CoalesceResult<()> {
        Ok(())
    }

    /// Subscribes to announcements on `channel`.
    ///
    /// Returns `None` if the store does not support publish/subscribe.
    async fn subscribe(&self, _channel: &str) -> CoalesceResult<Option<Notifications>> {
        Ok(None)
    }

    /// A short name for this kind of store, used in logs and metrics.
    fn name(&self) -> &'static str;
}

/// A record in the [`InMemoryStore`].
#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    /// `None` if the TTL reaches beyond what an [`Instant`] can represent.
    expires_at: Option<Instant>,
}

impl Record {
    fn new(value: &[u8], now: Instant, ttl: Duration) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_alive(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// A store living in the memory of the current process.
///
/// This provides coalescing between tasks of a single process only, and is mostly useful for
/// local setups and for testing. Expiration is measured with [`tokio::time::Instant`], so tests
/// can control it by pausing and advancing time.
///
/// Expired records are dropped on every write, and channels are dropped once their last
/// subscriber is gone, so the store only holds what is still in use.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, Record>>,
    channels: Mutex<HashMap<String, broadcast::Sender<()>>>,
    unavailable: AtomicBool,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let records = self.records.try_lock().map(|r| r.len()).unwrap_or_default();
        f.debug_struct("InMemoryStore")
            .field("records", &records)
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: while unavailable, every operation fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Returns the number of records that have not yet expired.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records().values().filter(|r| r.is_alive(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> CoalesceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoalesceError::StoreUnavailable(
                "in-memory store is marked unavailable".into(),
            ));
        }
        Ok(())
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        // the map stays consistent even if a holder panicked, none of the critical sections
        // leave it half-updated
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<()>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> CoalesceResult<Option<Vec<u8>>> {
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.records();
        match records.get(key) {
            Some(record) if record.is_alive(now) => Ok(Some(record.value.clone())),
            Some(_) => {
                records.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CoalesceResult<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.records();
        records.retain(|_, record| record.is_alive(now));
        records.insert(key.to_owned(), Record::new(value, now, ttl));
        Ok(())
    }

    async fn try_acquire(
        &self,
        lock_key: &str,
        token: &str,
        ttl: Duration,
    ) -> CoalesceResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.records();
        records.retain(|_, record| record.is_alive(now));
        if records.contains_key(lock_key) {
            return Ok(false);
        }
        records.insert(lock_key.to_owned(), Record::new(token.as_bytes(), now, ttl));
        Ok(true)
    }

    async fn release(&self, lock_key: &str, token: &str) -> CoalesceResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.records();
        let owned = records
            .get(lock_key)
            .is_some_and(|r| r.is_alive(now) && r.value == token.as_bytes());
        if owned {
            records.remove(lock_key);
        }
        Ok(owned)
    }

    async fn publish(&self, channel: &str) -> CoalesceResult<()> {
        self.check_available()?;
        let mut channels = self.channels();
        if let Some(sender) = channels.get(channel) {
            // no receivers is fine, nobody is waiting
            let _ = sender.send(());
        }
        channels.retain(|_, sender| sender.receiver_count() > 0);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CoalesceResult<Option<Notifications>> {
        self.check_available()?;
        let mut channels = self.channels();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        let receiver = channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(16).0)
            .subscribe();
        drop(channels);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                // a lagging receiver has missed notifications, which is still a notification
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(((), receiver)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(Some(Box::pin(stream)))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
