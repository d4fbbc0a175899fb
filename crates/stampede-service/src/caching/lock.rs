//! A lock with at most one holder per resource, across all processes sharing a store.

use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle;
use uuid::Uuid;

use super::store::StoreRef;
use super::{CoalesceResult, ResourceKey};
use crate::utils::defer::{DeferGuard, defer};

type ScopedRelease = DeferGuard<Box<dyn FnOnce() + Send + Sync>>;

/// Guards production of resources by holding a lock record per resource in the store.
///
/// Lock records expire after the configured TTL, so a holder that crashes can not block a
/// resource forever. The TTL must therefore exceed the worst-case computation time, otherwise a
/// second producer may start while the first one is still running.
#[derive(Clone)]
pub struct DistributedLock {
    store: StoreRef,
    ttl: Duration,
    prefix: String,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("store", &self.store.name())
            .field("ttl", &self.ttl)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(store: StoreRef, ttl: Duration, prefix: impl Into<String>) -> Self {
        Self {
            store,
            ttl,
            prefix: prefix.into(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Tries to become the single holder of the lock for `key`, without waiting.
    ///
    /// Returns `None` if somebody else holds the lock.
    pub async fn acquire(&self, key: &ResourceKey) -> CoalesceResult<Option<LockGuard>> {
        let lock_key = key.lock_key(&self.prefix);
        let token = Uuid::new_v4().simple().to_string();

        if !self.store.try_acquire(&lock_key, &token, self.ttl).await? {
            tracing::trace!(%lock_key, "Lock is held by another producer");
            return Ok(None);
        }

        metric!(counter("coalesce.lock.acquired") += 1, "store" => self.store.name());
        tracing::debug!(%lock_key, ttl = ?self.ttl, "Acquired lock");

        let scoped_release = scoped_release(self.store.clone(), lock_key.clone(), token.clone());
        Ok(Some(LockGuard {
            store: self.store.clone(),
            lock_key,
            token,
            scoped_release,
        }))
    }
}

/// Creates the guard releasing a lock that was never explicitly released.
///
/// This covers every way of leaving the critical section without calling
/// [`LockGuard::release`]: early returns, panics, and the owning future being dropped. As
/// dropping can not wait for the store, the release runs as a task on the runtime the lock was
/// acquired on. Without a runtime, the record is left to expire.
fn scoped_release(store: StoreRef, lock_key: String, token: String) -> ScopedRelease {
    let runtime = Handle::try_current().ok();
    let on_drop: Box<dyn FnOnce() + Send + Sync> = Box::new(move || {
        let Some(runtime) = runtime else {
            tracing::warn!(%lock_key, "No runtime to release lock on, leaving it to expire");
            return;
        };
        tracing::debug!(%lock_key, "Releasing abandoned lock in the background");
        runtime.spawn(async move {
            if let Err(err) = release(&store, &lock_key, &token).await {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %lock_key,
                    "Failed to release abandoned lock, leaving it to expire",
                );
            }
        });
    });
    defer(on_drop)
}

async fn release(store: &StoreRef, lock_key: &str, token: &str) -> CoalesceResult<bool> {
    let released = store.release(lock_key, token).await?;
    if !released {
        // our record expired, and possibly somebody else holds the lock by now
        metric!(counter("coalesce.lock.stale_release") += 1, "store" => store.name());
        tracing::warn!(%lock_key, "Lock expired before it was released");
    }
    Ok(released)
}

/// Proof of holding the lock for one resource.
///
/// The lock is released by [`release`](Self::release), or in the background when the guard is
/// dropped.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    store: StoreRef,
    lock_key: String,
    token: String,
    scoped_release: ScopedRelease,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_key", &self.lock_key)
            .field("token", &self.token)
            .finish()
    }
}

impl LockGuard {
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// The random token identifying this holder in the lock record.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Releases the lock.
    ///
    /// Returns `false` if the lock record had already expired. Only the record created by this
    /// guard is ever deleted, even if another producer acquired the lock after it expired.
    pub async fn release(self) -> CoalesceResult<bool> {
        let LockGuard {
            store,
            lock_key,
            token,
            scoped_release,
        } = self;
        scoped_release.disarm();

        let released = release(&store, &lock_key, &token).await?;
        if released {
            tracing::debug!(%lock_key, "Released lock");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::caching::store::{CacheStore, InMemoryStore};

    const TTL: Duration = Duration::from_secs(10);

    fn lock() -> (Arc<InMemoryStore>, DistributedLock) {
        let store = Arc::new(InMemoryStore::new());
        let lock = DistributedLock::new(store.clone(), TTL, "lock:");
        (store, lock)
    }

    #[tokio::test]
    async fn test_single_holder() {
        let (store, lock) = lock();
        let key = ResourceKey::from("resource");

        let guard = lock.acquire(&key).await.unwrap().unwrap();
        assert_eq!(guard.lock_key(), "lock:resource");
        assert_eq!(
            store.get("lock:resource").await.unwrap(),
            Some(guard.token().as_bytes().to_vec())
        );

        assert!(lock.acquire(&key).await.unwrap().is_none());
        // other resources are independent
        assert!(
            lock.acquire(&ResourceKey::from("other"))
                .await
                .unwrap()
                .is_some()
        );

        assert!(guard.release().await.unwrap());
        assert!(lock.acquire(&key).await.unwrap().is_some());
    }

    /// A holder that dies without releasing blocks others for exactly one TTL.
    #[tokio::test(start_paused = true)]
    async fn test_expires_after_crash() {
        let (_store, lock) = lock();
        let key = ResourceKey::from("resource");

        let guard = lock.acquire(&key).await.unwrap().unwrap();
        // a crashed process never runs its destructors
        std::mem::forget(guard);

        assert!(lock.acquire(&key).await.unwrap().is_none());

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert!(lock.acquire(&key).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(lock.acquire(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_released_on_drop() {
        let (store, lock) = lock();
        let key = ResourceKey::from("resource");

        drop(lock.acquire(&key).await.unwrap().unwrap());

        // let the background release run
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get("lock:resource").await.unwrap(), None);
        assert!(lock.acquire(&key).await.unwrap().is_some());
    }

    /// A delayed release must not delete the lock of the producer that came after.
    #[tokio::test(start_paused = true)]
    async fn test_stale_release_keeps_new_holder() {
        let (store, lock) = lock();
        let key = ResourceKey::from("resource");

        let first = lock.acquire(&key).await.unwrap().unwrap();
        tokio::time::advance(TTL).await;

        let second = lock.acquire(&key).await.unwrap().unwrap();
        assert!(!first.release().await.unwrap());

        assert_eq!(
            store.get("lock:resource").await.unwrap(),
            Some(second.token().as_bytes().to_vec())
        );
        assert!(lock.acquire(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_is_not_contention() {
        let (store, lock) = lock();
        store.set_available(false);

        let result = lock.acquire(&ResourceKey::from("resource")).await;
        assert!(matches!(
            result,
            Err(crate::caching::CoalesceError::StoreUnavailable(_))
        ));
    }
}
