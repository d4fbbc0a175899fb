use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::codec::{self, ComputationResult};
use super::lock::{DistributedLock, LockGuard};
use super::store::{Notifications, StoreRef};
use super::subset::select;
use super::{CoalesceError, CoalesceResult, ResourceKey};
use crate::config::CoalescingConfig;
use crate::utils::defer::defer;

/// Number of consecutive empty polls after which a waiter tries to take over production.
///
/// This recovers from a producer that died, or failed, while all other callers were waiting.
const LOCK_RETRY_POLLS: usize = 10;

/// How waiters learn that a computation has finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    /// Re-read the cache every poll interval.
    #[default]
    Poll,
    /// Subscribe to a per-resource channel and re-read the cache when the producer announces
    /// completion, falling back to polling at the poll interval.
    ///
    /// Stores without publish/subscribe support degrade to [`WaitStrategy::Poll`].
    Notify,
}

/// Options for a single [`Coalescer::fetch_with`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// A point in time after which the caller stops waiting for a concurrent computation.
    ///
    /// The configured wait timeout still applies, whichever ends earlier is used.
    pub deadline: Option<Instant>,
}

impl FetchOptions {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// Stops waiting after `timeout`.
    ///
    /// A timeout too large to be represented as a point in time sets no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
        }
    }
}

/// The expensive computation whose concurrent executions are coalesced.
pub trait ComputationRequest: 'static + Send + Sync + Clone {
    /// Computes the result for `key`.
    ///
    /// For every resource key, at most one call of this runs at a time across all processes
    /// sharing the store, as long as it finishes within the lock TTL. A returned error is only
    /// seen by the caller that ran the computation, and nothing is cached.
    fn compute<'a>(
        &'a self,
        key: &'a ResourceKey,
    ) -> BoxFuture<'a, anyhow::Result<ComputationResult>>;
}

/// The point in time at which a waiting caller gives up.
///
/// Without one, the caller waits for as long as it takes.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Option<Instant>,
    /// Total time the caller was willing to wait, reported in the timeout error.
    budget: Duration,
}

impl Deadline {
    fn new(wait_timeout: Duration, options: FetchOptions) -> Self {
        let now = Instant::now();
        let at = earliest(now.checked_add(wait_timeout), options.deadline);
        let budget = match at {
            Some(at) => at.saturating_duration_since(now),
            None => Duration::MAX,
        };
        Self { at, budget }
    }

    fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Returns the earlier of two optional points in time, where `None` is never.
fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending::<()>().await,
    }
}

/// How a stretch of waiting ended.
enum Waited {
    Ready(ComputationResult),
    /// Nothing appeared for a while.
    Stalled,
    /// A producer announced it was done, yet there is no entry.
    Vacant,
}

enum Wakeup {
    Timer,
    Notified,
    Closed,
}

/// Coalesces concurrent computations of the same resource across processes.
///
/// For every resource, the first caller that finds the cache empty becomes the producer: it
/// takes the distributed lock, runs the [`ComputationRequest`] and writes the result to the
/// cache. Everybody else waits for the cache entry to appear.
///
/// The coalescer holds no state of its own apart from the store connection. All coordination
/// happens through the store, which makes it safe to use from any number of tasks, processes,
/// and hosts at the same time.
pub struct Coalescer<T: ComputationRequest> {
    config: CoalescingConfig,
    store: StoreRef,
    lock: DistributedLock,
    request: T,
}

impl<T: ComputationRequest> Clone for Coalescer<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            lock: self.lock.clone(),
            request: self.request.clone(),
        }
    }
}

impl<T: ComputationRequest> fmt::Debug for Coalescer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("lock", &self.lock)
            .finish()
    }
}

impl<T: ComputationRequest> Coalescer<T> {
    pub fn new(config: CoalescingConfig, store: StoreRef, request: T) -> Self {
        let lock =
            DistributedLock::new(store.clone(), config.lock_ttl, config.lock_prefix.clone());
        Self {
            config,
            store,
            lock,
            request,
        }
    }

    pub fn config(&self) -> &CoalescingConfig {
        &self.config
    }

    /// Returns the result for `key`, computing it at most once across all concurrent callers.
    ///
    /// See [`fetch_with`](Self::fetch_with).
    pub async fn fetch(&self, key: &ResourceKey, selector: Option<&str>) -> CoalesceResult<Value> {
        self.fetch_with(key, selector, FetchOptions::default()).await
    }

    /// Returns the result for `key`, or the field named by `selector` out of it.
    ///
    /// Errors:
    ///
    /// - [`CoalesceError::StoreUnavailable`] as soon as any store operation fails.
    /// - [`CoalesceError::ComputationFailed`] if this caller ran the computation and it failed.
    /// - [`CoalesceError::CoalesceTimeout`] if the result of a concurrent computation did not
    ///   show up in time. Only waiting is bounded, a computation run by this caller is not.
    /// - [`CoalesceError::FieldNotFound`] for a missing field with
    ///   [`SelectorMode::Strict`](super::SelectorMode::Strict).
    ///
    /// Dropping the returned future cancels the call. If this caller is computing the result at
    /// that time, its lock is released in the background.
    #[tracing::instrument(skip_all, fields(%key, ?selector))]
    pub async fn fetch_with(
        &self,
        key: &ResourceKey,
        selector: Option<&str>,
        options: FetchOptions,
    ) -> CoalesceResult<Value> {
        metric!(counter("coalesce.access") += 1, "store" => self.store.name());

        let result = match self.lookup(key, "cache").await? {
            Some(result) => result,
            None => {
                let deadline = Deadline::new(self.config.wait_timeout, options);
                self.coordinate(key, deadline).await?
            }
        };

        select(result, selector, self.config.selector_mode)
    }

    /// Reads and decodes the cache entry for `key`.
    ///
    /// A corrupt entry is reported as a miss, so that it is recomputed and overwritten.
    async fn lookup(
        &self,
        key: &ResourceKey,
        phase: &'static str,
    ) -> CoalesceResult<Option<ComputationResult>> {
        let Some(bytes) = self.store.get(key.as_str()).await? else {
            return Ok(None);
        };

        match codec::decode(&bytes) {
            Ok(result) => {
                metric!(counter("coalesce.hit") += 1, "phase" => phase);
                Ok(Some(result))
            }
            Err(err) => {
                metric!(counter("coalesce.corrupt_entry") += 1);
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Ignoring corrupt cache entry",
                );
                Ok(None)
            }
        }
    }

    /// Produces the result, or waits for whoever else does.
    async fn coordinate(
        &self,
        key: &ResourceKey,
        deadline: Deadline,
    ) -> CoalesceResult<ComputationResult> {
        let mut notifications = None;
        let mut subscribed = false;

        loop {
            if let Some(guard) = self.lock.acquire(key).await? {
                return self.produce(key, guard).await;
            }
            metric!(counter("coalesce.lock.contended") += 1);

            if self.config.wait_strategy == WaitStrategy::Notify && !subscribed {
                subscribed = true;
                notifications = self.subscribe(key).await?;
            }

            match self.wait(key, deadline, &mut notifications).await? {
                Waited::Ready(result) => return Ok(result),
                Waited::Stalled => {
                    tracing::debug!("No result after {LOCK_RETRY_POLLS} polls, retrying lock");
                }
                Waited::Vacant => {
                    tracing::debug!("Producer finished without a result, retrying lock");
                }
            }
        }
    }

    async fn subscribe(&self, key: &ResourceKey) -> CoalesceResult<Option<Notifications>> {
        let channel = key.notify_channel(&self.config.notify_prefix);
        let notifications = self.store.subscribe(&channel).await?;
        if notifications.is_none() {
            tracing::warn!(
                store = self.store.name(),
                "Store does not support notifications, falling back to polling",
            );
        }
        Ok(notifications)
    }

    /// Waits for another producer's result to appear in the cache.
    ///
    /// Returns without a result when it is time to retry the lock, and fails with
    /// [`CoalesceError::CoalesceTimeout`] once the deadline passes.
    async fn wait(
        &self,
        key: &ResourceKey,
        deadline: Deadline,
        notifications: &mut Option<Notifications>,
    ) -> CoalesceResult<Waited> {
        let started = Instant::now();
        let _wait_timer = defer(move || {
            metric!(timer("coalesce.wait.duration") = started.elapsed());
        });

        for _ in 0..LOCK_RETRY_POLLS {
            let next_poll = Instant::now().checked_add(self.config.poll_interval);
            let wake_at = earliest(next_poll, deadline.at);

            let wakeup = match notifications.as_mut() {
                Some(stream) => tokio::select! {
                    _ = sleep_until(wake_at) => Wakeup::Timer,
                    notification = stream.next() => match notification {
                        Some(()) => Wakeup::Notified,
                        None => Wakeup::Closed,
                    },
                },
                None => {
                    sleep_until(wake_at).await;
                    Wakeup::Timer
                }
            };
            if let Wakeup::Closed = wakeup {
                tracing::debug!("Notification stream ended, falling back to polling");
                *notifications = None;
            }

            metric!(counter("coalesce.wait.polls") += 1);
            if let Some(result) = self.lookup(key, "wait").await? {
                return Ok(Waited::Ready(result));
            }

            if deadline.is_expired() {
                metric!(counter("coalesce.timeout") += 1);
                tracing::debug!(
                    budget = ?deadline.budget,
                    "Gave up waiting for concurrent computation",
                );
                return Err(CoalesceError::CoalesceTimeout(deadline.budget));
            }
            if let Wakeup::Notified = wakeup {
                return Ok(Waited::Vacant);
            }
        }

        Ok(Waited::Stalled)
    }

    /// Runs the computation while holding the lock, and stores its result.
    ///
    /// The lock is released on every path through here, by `guard` itself if this future is
    /// dropped midway.
    async fn produce(
        &self,
        key: &ResourceKey,
        guard: LockGuard,
    ) -> CoalesceResult<ComputationResult> {
        // another producer may have finished between our cache miss and taking the lock
        let outcome = match self.lookup(key, "recheck").await {
            Ok(Some(result)) => Ok(result),
            Ok(None) => self.compute_and_store(key).await,
            Err(err) => Err(err),
        };

        if let Err(err) = guard.release().await {
            // the lock expires on its own, our result is still good
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Failed to release lock",
            );
        }

        if self.config.wait_strategy == WaitStrategy::Notify {
            let channel = key.notify_channel(&self.config.notify_prefix);
            if let Err(err) = self.store.publish(&channel).await {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to notify waiters",
                );
            }
        }

        outcome
    }

    async fn compute_and_store(&self, key: &ResourceKey) -> CoalesceResult<ComputationResult> {
        tracing::debug!("Computing resource");
        let result = match self.request.compute(key).await {
            Ok(result) => result,
            Err(err) => {
                metric!(counter("coalesce.computation") += 1, "status" => "failed");
                tracing::warn!(error = ?err, "Computation failed");
                return Err(CoalesceError::ComputationFailed(format!("{err:#}")));
            }
        };
        metric!(counter("coalesce.computation") += 1, "status" => "success");

        let bytes = codec::encode(&result).map_err(|err| {
            CoalesceError::ComputationFailed(format!("failed to encode result: {err}"))
        })?;
        self.store
            .set(key.as_str(), &bytes, self.config.cache_ttl)
            .await?;

        Ok(result)
    }
}
