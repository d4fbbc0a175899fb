//! Helpers for testing the coalescing service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests talking to a real Redis server should obtain its URL through [`redis_url!`]. The
//!    macro returns early from the test when no server is configured, as a poor substitute
//!    for skipping tests.
//!
//!  - Tests sharing a Redis server must use unique keys, see [`unique_key`]. Test binaries run
//!    in parallel, and stale keys from previous runs only go away once their TTL expires.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Name of the environment variable pointing at a Redis server for integration tests.
pub const REDIS_URL_ENV: &str = "STAMPEDE_TEST_REDIS_URL";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `stampede_service` crate and
///    mutes all other logs (such as the redis client).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("stampede_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Returns the URL of the Redis server used for integration tests, if one is configured.
///
/// Reads [`REDIS_URL_ENV`] first and falls back to the conventional `REDIS_URL`.
pub fn redis_url_from_env() -> Option<String> {
    [REDIS_URL_ENV, "REDIS_URL"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|url| !url.is_empty())
}

/// Returns a key that is unique for this process and call.
///
/// The key is prefixed with `prefix` and the current time, so that concurrent or repeated
/// test runs against the same Redis server never observe each other's entries.
pub fn unique_key(prefix: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("stampede-test/{prefix}/{}/{nanos}/{seq}", std::process::id())
}

/// Returns the Redis URL for integration tests or returns from the calling test.
#[macro_export]
macro_rules! redis_url {
    () => {
        match $crate::redis_url_from_env() {
            Some(url) => url,
            None => {
                println!(
                    "Skipping due to missing {} or REDIS_URL",
                    $crate::REDIS_URL_ENV
                );
                return;
            }
        }
    };
}
