use std::time::Duration;

use stampede_service::caching::{
    CoalesceError, CoalescingConfig, DistributedLock, RedisStoreConfig, ResourceKey,
    StoreConfig, WaitStrategy,
};
use stampede_test::unique_key;

use crate::{ExpensiveReport, SELECTORS, assert_scenario_results, coalescer};

fn store_config(url: String) -> StoreConfig {
    StoreConfig::Redis(RedisStoreConfig {
        url,
        connect_timeout: Duration::from_secs(5),
        operation_timeout: Duration::from_secs(1),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_five_callers() {
    let url = stampede_test::redis_url!();

    for wait_strategy in [WaitStrategy::Poll, WaitStrategy::Notify] {
        let config = CoalescingConfig {
            poll_interval: Duration::from_millis(20),
            wait_strategy,
            ..Default::default()
        };
        let report = ExpensiveReport::new(Duration::from_millis(300));
        let key = unique_key("five-callers");

        let mut tasks = Vec::new();
        for selector in SELECTORS {
            // every caller has its own connection, like separate processes would
            let store = store_config(url.clone()).connect().await.unwrap();
            let coalescer = coalescer(store, config.clone(), &report);
            let key = ResourceKey::from(key.as_str());
            tasks.push(tokio::spawn(async move {
                coalescer.fetch(&key, selector).await
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }

        assert_eq!(report.computations(), 1, "{wait_strategy:?}");
        assert_scenario_results(&results);
    }
}

#[tokio::test]
async fn test_redis_lock_tokens() {
    let url = stampede_test::redis_url!();
    let store = store_config(url).connect().await.unwrap();
    let lock = DistributedLock::new(store.clone(), Duration::from_millis(500), "lock:");
    let key = ResourceKey::from(unique_key("lock"));

    let first = lock.acquire(&key).await.unwrap().unwrap();
    assert!(lock.acquire(&key).await.unwrap().is_none());

    // let the first lock expire and hand it to somebody else
    tokio::time::sleep(Duration::from_millis(600)).await;
    let second = lock.acquire(&key).await.unwrap().unwrap();

    // the stale holder can not release the new holder's lock
    assert!(!first.release().await.unwrap());
    assert!(lock.acquire(&key).await.unwrap().is_none());

    assert!(second.release().await.unwrap());
    assert!(lock.acquire(&key).await.unwrap().is_some());
}

#[tokio::test]
async fn test_redis_unreachable() {
    stampede_test::setup();
    // nothing listens on the discard port
    let config = StoreConfig::Redis(RedisStoreConfig {
        url: "redis://127.0.0.1:9/".into(),
        connect_timeout: Duration::from_millis(500),
        operation_timeout: Duration::from_millis(500),
    });
    assert!(config.connect().await.is_err());
}

#[tokio::test]
async fn test_redis_wait_timeout() {
    let url = stampede_test::redis_url!();
    let store = store_config(url).connect().await.unwrap();
    let key = ResourceKey::from(unique_key("timeout"));

    let lock = DistributedLock::new(store.clone(), Duration::from_secs(10), "lock:");
    let guard = lock.acquire(&key).await.unwrap().unwrap();

    let config = CoalescingConfig {
        poll_interval: Duration::from_millis(20),
        wait_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let report = ExpensiveReport::new(Duration::ZERO);
    let coalescer = coalescer(store, config, &report);

    let result = coalescer.fetch(&key, None).await;
    assert_eq!(
        result,
        Err(CoalesceError::CoalesceTimeout(Duration::from_millis(300)))
    );
    assert_eq!(report.computations(), 0);

    guard.release().await.unwrap();
}
