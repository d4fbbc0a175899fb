use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stampede_service::caching::{
    CoalescingConfig, InMemoryStore, ResourceKey, StoreConfig, WaitStrategy,
};

use crate::{ExpensiveReport, SELECTORS, assert_scenario_results, coalescer};

/// Five callers on separate tasks, each with its own coalescer, share a single computation.
async fn run_scenario(config: CoalescingConfig) {
    let store = StoreConfig::Memory.connect().await.unwrap();
    let report = ExpensiveReport::new(Duration::from_millis(300));

    let tasks: Vec<_> = SELECTORS
        .into_iter()
        .map(|selector| {
            let coalescer = coalescer(store.clone(), config.clone(), &report);
            tokio::spawn(async move {
                coalescer
                    .fetch(&ResourceKey::from("expensive_resource"), selector)
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    assert_eq!(report.computations(), 1);
    assert_scenario_results(&results);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_callers_polling() {
    let config = CoalescingConfig {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    run_scenario(config).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_callers_notified() {
    let config = CoalescingConfig {
        wait_strategy: WaitStrategy::Notify,
        ..Default::default()
    };
    run_scenario(config).await;
}

/// Results are served from the cache until they expire.
#[tokio::test(start_paused = true)]
async fn test_cached_until_expiry() {
    let store = Arc::new(InMemoryStore::new());
    let report = ExpensiveReport::new(Duration::from_millis(300));
    let config = CoalescingConfig {
        cache_ttl: Duration::from_secs(10),
        ..Default::default()
    };
    let coalescer = coalescer(store.clone(), config, &report);
    let key = ResourceKey::from("expensive_resource");

    let results = futures::future::join_all(
        SELECTORS
            .into_iter()
            .map(|selector| coalescer.fetch(&key, selector)),
    )
    .await;
    let results: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert_scenario_results(&results);
    assert_eq!(report.computations(), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(coalescer.fetch(&key, Some("timestamp")).await, Ok(json!(123)));
    assert_eq!(report.computations(), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(coalescer.fetch(&key, Some("timestamp")).await, Ok(json!(123)));
    assert_eq!(report.computations(), 2);
}
