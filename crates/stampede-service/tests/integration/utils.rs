use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use stampede_service::caching::{
    Coalescer, CoalescingConfig, ComputationRequest, ComputationResult, ResourceKey, StoreRef,
};

/// An expensive computation of a report about a resource.
#[derive(Clone, Debug)]
pub struct ExpensiveReport {
    computations: Arc<AtomicUsize>,
    delay: Duration,
}

impl ExpensiveReport {
    pub fn new(delay: Duration) -> Self {
        Self {
            computations: Default::default(),
            delay,
        }
    }

    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    /// The result every computation produces.
    pub fn report() -> ComputationResult {
        ComputationResult::new()
            .with_field("data", "X")
            .with_field("timestamp", 123)
            .with_field("extra_info", json!({"field1": "v1"}))
    }
}

impl ComputationRequest for ExpensiveReport {
    fn compute<'a>(
        &'a self,
        key: &'a ResourceKey,
    ) -> BoxFuture<'a, anyhow::Result<ComputationResult>> {
        Box::pin(async move {
            self.computations.fetch_add(1, Ordering::SeqCst);
            tracing::info!(%key, "Computing expensive report");
            tokio::time::sleep(self.delay).await;
            Ok(Self::report())
        })
    }
}

/// Creates a coalescer over `store`, as every process sharing the store would.
pub fn coalescer(
    store: StoreRef,
    config: CoalescingConfig,
    report: &ExpensiveReport,
) -> Coalescer<ExpensiveReport> {
    stampede_test::setup();
    Coalescer::new(config, store, report.clone())
}

/// The selectors of the five callers in the coalescing scenarios.
pub const SELECTORS: [Option<&str>; 5] = [
    None,
    Some("timestamp"),
    Some("timestamp"),
    Some("extra_info"),
    Some("extra_info"),
];

/// Checks what each of the callers using [`SELECTORS`] received.
pub fn assert_scenario_results(results: &[serde_json::Value]) {
    assert_eq!(results.len(), SELECTORS.len());
    assert_eq!(
        results[0],
        json!({"data": "X", "timestamp": 123, "extra_info": {"field1": "v1"}})
    );
    assert_eq!(results[1], json!(123));
    assert_eq!(results[2], json!(123));
    assert_eq!(results[3], json!({"field1": "v1"}));
    assert_eq!(results[4], json!({"field1": "v1"}));
}
