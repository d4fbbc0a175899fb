use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{SelectorMode, StoreConfig, WaitStrategy};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "stampede".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Tuning of the coalescing protocol.
///
/// All processes sharing a store should use the same values. In particular, diverging prefixes
/// make processes ignore each other's locks.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoalescingConfig {
    /// How long a computed result stays in the cache.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// How long a lock record lives if it is never released.
    ///
    /// This must exceed the worst-case computation time. Otherwise the lock expires while the
    /// first computation is still running and a second producer starts.
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,

    /// Delay between two cache reads of a waiter.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// The longest a caller waits for a concurrent computation before giving up.
    ///
    /// A duration too large to be represented as a point in time, such as
    /// [`Duration::MAX`], means waiting without bound.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,

    /// How waiters learn about a finished computation.
    pub wait_strategy: WaitStrategy,

    /// How a selector naming a missing field is treated.
    pub selector_mode: SelectorMode,

    /// Prefix of lock records, in the same namespace as cache entries.
    ///
    /// Lock records and cache entries share one keyspace, so resource keys must never start
    /// with this prefix. A resource named `lock:foo` would otherwise read the lock record of
    /// `foo` as its cache entry, and overwrite it when it is produced. Choose a prefix that
    /// cannot occur in resource keys.
    pub lock_prefix: String,

    /// Prefix of the notification channels used by [`WaitStrategy::Notify`].
    pub notify_prefix: String,
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            wait_timeout: Duration::from_secs(30),
            wait_strategy: WaitStrategy::default(),
            selector_mode: SelectorMode::default(),
            lock_prefix: "lock:".into(),
            notify_prefix: "notify:".into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration of the logging system.
    pub logging: Logging,

    /// Configuration of the metrics system.
    pub metrics: Metrics,

    /// Tuning of request coalescing.
    pub coalescing: CoalescingConfig,

    /// The store shared by all coalescing processes.
    pub store: StoreConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::caching::RedisStoreConfig;

    #[test]
    fn test_coalescing_config() {
        // Individual values can be set in reasonable units without affecting the others.
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.coalescing, CoalescingConfig::default());
        assert_eq!(cfg.coalescing.poll_interval, Duration::from_millis(100));

        let yaml = r#"
            coalescing:
              cache_ttl: 5m
              poll_interval: 20ms
              wait_strategy: notify
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.coalescing.cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.coalescing.poll_interval, Duration::from_millis(20));
        assert_eq!(cfg.coalescing.wait_strategy, WaitStrategy::Notify);

        let defaults = CoalescingConfig::default();
        assert_eq!(cfg.coalescing.lock_ttl, defaults.lock_ttl);
        assert_eq!(cfg.coalescing.wait_timeout, defaults.wait_timeout);
        assert_eq!(cfg.coalescing.selector_mode, SelectorMode::Lenient);
        assert_eq!(cfg.coalescing.lock_prefix, "lock:");
    }

    #[test]
    fn test_store_section() {
        let yaml = r#"
            store:
              type: redis
              url: "redis://cache:6379/1"
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.store,
            StoreConfig::Redis(RedisStoreConfig {
                url: "redis://cache:6379/1".into(),
                connect_timeout: Duration::from_secs(5),
                operation_timeout: Duration::from_secs(1),
            })
        );

        let cfg = Config::from_reader("logging: {}".as_bytes()).unwrap();
        assert_eq!(cfg.store, StoreConfig::Memory);
    }

    #[test]
    fn test_logging() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: verbose
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            coalescing:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_get_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "metrics:\n  prefix: coalescer").unwrap();

        let cfg = Config::get(Some(file.path())).unwrap();
        assert_eq!(cfg.metrics.prefix, "coalescer");

        assert!(Config::get(Some(Path::new("/nonexistent/stampede.yml"))).is_err());
    }
}
