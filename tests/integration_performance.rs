//! Throughput checks for the credential services.
//!
//! Thresholds are deliberately loose so unoptimized test builds pass; they
//! exist to catch accidental quadratic behaviour or blocking, not to
//! benchmark.
//!
//! Run with: cargo test --test integration_performance -- --nocapture

use credential_core::storage::{DocumentStore, MemoryStore};
use credential_core::{CredentialError, OneTimeCodeService, RedeemCodeService, StoreService};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Performance benchmark result
#[derive(Debug)]
pub struct BenchmarkResult {
    pub operation: String,
    pub duration: Duration,
    pub operations: usize,
    pub ops_per_sec: f64,
}

impl BenchmarkResult {
    pub fn new(operation: &str, duration: Duration, operations: usize) -> Self {
        let ops_per_sec = operations as f64 / duration.as_secs_f64();
        Self {
            operation: operation.to_string(),
            duration,
            operations,
            ops_per_sec,
        }
    }

    pub fn print(&self) {
        println!(
            "  {}: {:?} ({:.0} ops/sec, {} ops)",
            self.operation, self.duration, self.ops_per_sec, self.operations
        );
    }

    pub fn assert_min_ops_per_sec(&self, min_ops: f64) {
        assert!(
            self.ops_per_sec >= min_ops,
            "{} should achieve at least {:.0} ops/sec, got {:.0}",
            self.operation,
            min_ops,
            self.ops_per_sec
        );
    }
}

/// Benchmark a closure and return the result alongside its output
pub async fn benchmark<F, Fut, R>(operation: &str, operations: usize, f: F) -> (BenchmarkResult, R)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let start = Instant::now();
    let output = f().await;
    let duration = start.elapsed();
    (BenchmarkResult::new(operation, duration, operations), output)
}

#[tokio::test]
async fn test_onetime_issue_and_consume_throughput() -> Result<(), CredentialError> {
    println!("One-Time Code Throughput");
    println!("========================\n");

    let dataset_size = 500;
    let service = OneTimeCodeService::builder().build_and_init().await?;

    let (issue, codes) = benchmark("Sequential issuance", dataset_size, || async {
        let mut codes = Vec::with_capacity(dataset_size);
        for i in 0..dataset_size {
            codes.push(service.create_code(&format!("user-{i}"), "login").await?);
        }
        Ok::<_, CredentialError>(codes)
    })
    .await;
    issue.print();
    let codes = codes?;
    assert_eq!(codes.len(), dataset_size);

    let (consume, consumed) = benchmark("Sequential consumption", dataset_size, || async {
        let mut consumed = 0;
        for (i, code) in codes.iter().enumerate() {
            if service.consume_code(&format!("user-{i}"), "login", code).await? {
                consumed += 1;
            }
        }
        Ok::<_, CredentialError>(consumed)
    })
    .await;
    consume.print();
    assert_eq!(consumed?, dataset_size);

    issue.assert_min_ops_per_sec(200.0);
    consume.assert_min_ops_per_sec(200.0);
    assert_eq!(
        service.store().get_stats(service.collection()).await?.total_records,
        0
    );
    Ok(())
}

#[tokio::test]
async fn test_concurrent_issuance_throughput() -> Result<(), CredentialError> {
    let tasks_count = 10;
    let per_task = 50;
    let service = Arc::new(OneTimeCodeService::builder().build_and_init().await?);

    let (result, outcome) = benchmark("Concurrent issuance", tasks_count * per_task, || async {
        let mut tasks = JoinSet::new();
        for t in 0..tasks_count {
            let service = Arc::clone(&service);
            tasks.spawn(async move {
                for _ in 0..per_task {
                    service.create_code(&format!("owner-{t}"), "login").await?;
                }
                Ok::<(), CredentialError>(())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("task panicked")?;
        }
        Ok::<(), CredentialError>(())
    })
    .await;
    result.print();
    outcome?;
    result.assert_min_ops_per_sec(200.0);

    let stats = service.store().get_stats(service.collection()).await?;
    assert_eq!(stats.total_records, tasks_count * per_task);
    Ok(())
}

#[tokio::test]
async fn test_redeem_batch_and_transition_throughput() -> Result<(), CredentialError> {
    let dataset_size = 500;
    let store = Arc::new(MemoryStore::new());
    let service = RedeemCodeService::new(Arc::clone(&store))?;
    service.setup().await?;
    let codes: Vec<String> = (0..dataset_size).map(|i| format!("BATCH-{i:04}")).collect();

    let (batch, created) = benchmark("Batch creation", dataset_size, || async {
        service
            .create_codes(codes.as_slice(), "premium_month", "admin")
            .await
    })
    .await;
    batch.print();
    assert_eq!(created?.len(), dataset_size);

    let (transitions, started) = benchmark("Start processing", dataset_size, || async {
        let mut started = 0;
        for code in &codes {
            if service.start_processing_code(code, json!({})).await? {
                started += 1;
            }
        }
        Ok::<_, CredentialError>(started)
    })
    .await;
    transitions.print();
    assert_eq!(started?, dataset_size);

    batch.assert_min_ops_per_sec(200.0);
    transitions.assert_min_ops_per_sec(200.0);
    assert_eq!(store.get_stats(service.collection()).await?.total_records, dataset_size);
    Ok(())
}
