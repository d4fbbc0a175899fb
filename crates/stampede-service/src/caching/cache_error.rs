use std::time::Duration;

use thiserror::Error;

/// An error returned from [`Coalescer::fetch`](super::Coalescer::fetch).
///
/// A caller either receives a value or exactly one of these. Corrupt cache entries are not part
/// of this enum, they are handled like cache misses and never reach the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalesceError {
    /// The shared store could not be reached, or an operation on it timed out.
    ///
    /// This is never retried internally and never conflated with a cache miss or a contended
    /// lock, as either would lead to a stampede or to callers waiting on nothing during an
    /// outage.
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),
    /// The computation callback failed.
    ///
    /// Only the caller that ran the computation sees this. The lock has been released and no
    /// entry was written, so the next caller will retry the computation.
    #[error("computation failed: {0}")]
    ComputationFailed(String),
    /// A waiting caller gave up before a result became available.
    #[error("timed out waiting for a concurrent computation after {0:?}")]
    CoalesceTimeout(Duration),
    /// The requested field does not exist in the result.
    ///
    /// Only returned in [`SelectorMode::Strict`](super::SelectorMode::Strict).
    #[error("field not found: {0}")]
    FieldNotFound(String),
}

impl CoalesceError {
    /// Wraps a transport error talking to the store, logging it on the way.
    #[track_caller]
    pub fn from_store_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "Cache store operation failed");
        Self::StoreUnavailable(e.to_string())
    }

    /// Returns a short name of the error kind, suitable as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "store-unavailable",
            Self::ComputationFailed(_) => "computation-failed",
            Self::CoalesceTimeout(_) => "timeout",
            Self::FieldNotFound(_) => "field-not-found",
        }
    }
}

/// A result as returned by the coalescing layer.
pub type CoalesceResult<T> = Result<T, CoalesceError>;
