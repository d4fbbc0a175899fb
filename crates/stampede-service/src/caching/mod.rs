//! # Stampede request coalescing
//!
//! When a popular cache entry is missing or expires, every caller that notices would otherwise
//! go and recompute it at the same time. This module makes sure that, per resource key, only a
//! single caller across all processes sharing a [`CacheStore`] runs the computation, while all
//! other callers wait for its result to show up in the cache.
//!
//! ## Layers
//!
//! - A [`CacheStore`] provides plain reads and writes with expiration, plus lock records with
//!   "set if absent" and "compare and delete" semantics. There is an [`InMemoryStore`] for a
//!   single process and a [`RedisStore`] to coordinate between processes and hosts.
//! - The [`DistributedLock`] hands out a [`LockGuard`] to at most one producer per resource.
//!   Every guard owns a random token, so it can only ever release its own lock record.
//! - The codec turns a [`ComputationResult`] into the bytes of a cache entry and back.
//! - [`select`] extracts a single field out of a result.
//! - The [`Coalescer`] drives the protocol.
//!
//! A fetch goes through the following steps:
//! - It reads the cache entry. A hit is returned right away, a corrupt entry counts as a miss.
//! - On miss, it tries to take the lock for the resource.
//! - The caller that gets the lock reads the cache once more, then computes the result, writes it
//!   to the cache, and releases the lock. A failed computation is not cached, and its error is
//!   only returned to this caller.
//! - Everybody else waits, either by polling the cache or by listening for a notification from
//!   the producer. After a number of empty polls a waiter tries to take the lock itself, so that
//!   a producer which died or failed does not stall its waiters until they time out.
//!
//! Failures to talk to the store are never mistaken for a miss or a held lock. They surface as
//! [`CoalesceError::StoreUnavailable`], as treating an outage like a miss would stampede the
//! computation, and treating it like a held lock would stall every caller.
//!
//! ### Metrics
//!
//! - `coalesce.access`: All fetches.
//! - `coalesce.hit`: Fetches served from the cache, tagged with the `phase` they were found in:
//!   `cache` on the first read, `wait` while waiting, or `recheck` right after taking the lock.
//! - `coalesce.computation`: Computations being run, tagged with their `status`.
//! - `coalesce.corrupt_entry`: Cache entries that could not be decoded.
//! - `coalesce.lock.acquired` / `coalesce.lock.contended`: Lock attempts.
//! - `coalesce.lock.stale_release`: Locks that expired before their producer released them. This
//!   means the lock TTL is too short for the computation.
//! - `coalesce.wait.polls` and `coalesce.wait.duration`: Work done by waiters.
//! - `coalesce.timeout`: Waiters that gave up.
//!
//! ### Configuration
//!
//! See [`CoalescingConfig`] for the protocol's timings, and [`StoreConfig`] for the store.

mod cache_error;
mod cache_key;
mod codec;
mod coalescer;
mod lock;
mod redis;
mod store;
mod store_config;
mod subset;


pub use cache_error::{CoalesceError, CoalesceResult};
pub use cache_key::ResourceKey;
pub use codec::{ComputationResult, CorruptEntry, decode, encode};
pub use coalescer::{Coalescer, ComputationRequest, FetchOptions, WaitStrategy};
pub use lock::{DistributedLock, LockGuard};
pub use self::redis::RedisStore;
pub use store::{CacheStore, InMemoryStore, Notifications, StoreRef};
pub use store_config::{RedisStoreConfig, StoreConfig};
pub use subset::{SelectorMode, select};

pub use crate::config::CoalescingConfig;
