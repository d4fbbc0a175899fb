//! Stampede.
//!
//! Stampede prevents cache stampedes across processes and hosts: when many callers ask for the
//! same expensive resource at once, exactly one of them computes it while the others wait for
//! and reuse its result. All coordination goes through a shared key-value store, see
//! [`caching`] for how the protocol works.

#![warn(missing_debug_implementations, clippy::all)]

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;
