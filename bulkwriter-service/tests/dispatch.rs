//! Blackbox tests for batching, throttling and retries.
//!
//! These tests drive a [`BulkWriter`] against the in-memory backend and assert the guarantees of
//! the dispatcher: batch counts, exclusive dispatch of intents, convergence under injected errors,
//! and the bounds of the rate controller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bulkwriter_service::{
    Backend, BulkWriter, CommitResult, ErrorKind, FailureReason, Fields, InMemoryBackend, IntentId,
    OpError, RetryConfig, Simulation, ThrottleConfig, Write, WriteIntent, WriterConfig,
};
use serde_json::json;

fn fields(n: usize) -> Fields {
    let mut fields = Fields::new();
    fields.insert("n".into(), json!(n));
    fields.insert("payload".into(), json!("x".repeat(16)));
    fields
}

fn with_batch_size(max_batch_size: usize) -> WriterConfig {
    WriterConfig {
        max_batch_size,
        ..Default::default()
    }
}

/// Wraps a backend and counts intents that are part of two overlapping commits.
#[derive(Debug)]
struct ExclusiveCheck<B> {
    inner: B,
    in_flight: Mutex<HashSet<IntentId>>,
    violations: AtomicUsize,
}

impl<B> ExclusiveCheck<B> {
    fn new(inner: B) -> Self {
        Self {
            inner,
            in_flight: Mutex::new(HashSet::new()),
            violations: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl<B: Backend> Backend for ExclusiveCheck<B> {
    fn name(&self) -> &'static str {
        "exclusive-check"
    }

    async fn commit(&self, intents: &[WriteIntent]) -> CommitResult {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for intent in intents {
                if !in_flight.insert(intent.id()) {
                    self.violations.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let result = self.inner.commit(intents).await;

        let mut in_flight = self.in_flight.lock().unwrap();
        for intent in intents {
            in_flight.remove(&intent.id());
        }
        result
    }
}

/// Wraps a backend and records the peak payload size of all concurrent commits.
#[derive(Debug)]
struct ByteMeter<B> {
    inner: B,
    in_flight: AtomicU64,
    peak: AtomicU64,
}

impl<B> ByteMeter<B> {
    fn new(inner: B) -> Self {
        Self {
            inner,
            in_flight: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl<B: Backend> Backend for ByteMeter<B> {
    fn name(&self) -> &'static str {
        "byte-meter"
    }

    async fn commit(&self, intents: &[WriteIntent]) -> CommitResult {
        let bytes: u64 = intents.iter().map(|i| i.write().size_hint()).sum();
        let now = self.in_flight.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = self.inner.commit(intents).await;

        self.in_flight.fetch_sub(bytes, Ordering::SeqCst);
        result
    }
}

#[tokio::test]
async fn test_batches_without_retries() -> Result<()> {
    bulkwriter_test::tracing::init();

    let backend = InMemoryBackend::new(Simulation::default());
    let writer = BulkWriter::new(backend.clone(), with_batch_size(10))?;

    for i in 0..300 {
        writer.set(format!("doc-{i}"), fields(i))?;
    }
    let summary = writer.flush().await?;

    assert_eq!(summary.succeeded, 300);
    assert_eq!(summary.failed, 0);
    assert_eq!(backend.commits(), 30);
    assert_eq!(backend.len(), 300);

    let stats = writer.stats();
    assert_eq!(stats.batches, 30);
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.errors, 0);

    let report = writer.report();
    assert_eq!(report.batch_size, 10);
    assert_eq!(report.total_operations, 300);
    assert_eq!(report.error_count, 0);

    Ok(())
}

#[tokio::test]
async fn test_batch_count_for_all_sizes() -> Result<()> {
    let total: usize = 300;
    for batch_size in [1, 7, 10, 20, 64, 500] {
        let backend = InMemoryBackend::new(Simulation::default());
        let writer = BulkWriter::new(backend.clone(), with_batch_size(batch_size))?;

        for i in 0..total {
            writer.delete(format!("doc-{i}"))?;
        }
        let summary = writer.flush().await?;

        // deletes of missing documents fail terminally, which does not cause retries
        assert_eq!(summary.failed, total as u64);
        assert_eq!(
            backend.commits(),
            total.div_ceil(batch_size) as u64,
            "batch size {batch_size}"
        );
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_intent_in_two_concurrent_batches() -> Result<()> {
    let backend = Arc::new(ExclusiveCheck::new(InMemoryBackend::new(Simulation {
        latency: Duration::from_millis(5),
        max_concurrent_commits: Some(4),
        contention: true,
    })));
    let writer = BulkWriter::new(backend.clone(), with_batch_size(8))?;

    // a small key space makes overlapping commits contend and retry
    for i in 0..400 {
        writer.set(format!("doc-{}", i % 50), fields(i))?;
    }
    let summary = writer.flush().await?;

    assert_eq!(summary.succeeded, 400);
    assert_eq!(backend.violations.load(Ordering::Relaxed), 0);
    assert!(writer.counts().is_idle());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_bytes_stay_within_budget() -> Result<()> {
    let budget = 200;
    let backend = Arc::new(ByteMeter::new(InMemoryBackend::new(Simulation {
        latency: Duration::from_millis(20),
        ..Default::default()
    })));
    let config = WriterConfig {
        max_batch_size: 2,
        max_in_flight_bytes: bytesize::ByteSize::b(budget),
        ..Default::default()
    };
    let writer = BulkWriter::new(backend.clone(), config)?;

    // every write is about 40 bytes, so at most five of them fit into the budget
    for i in 0..100 {
        writer.set(format!("doc-{i}"), fields(i))?;
    }
    let summary = writer.flush().await?;

    assert_eq!(summary.succeeded, 100);
    let peak = backend.peak.load(Ordering::SeqCst);
    assert!(peak > 0);
    assert!(peak <= budget, "{peak} bytes in flight");
    assert!(writer.counts().is_idle());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_every_fifth_operation_aborted() -> Result<()> {
    let total: usize = 300;
    let max_attempts = 10;

    let hook = Arc::new(|seq: u64, _write: &Write| {
        (seq % 5 == 4).then(|| OpError::new(ErrorKind::Aborted, "injected conflict"))
    });
    let backend = InMemoryBackend::new(Simulation::default()).with_fault(hook);
    let config = WriterConfig {
        max_batch_size: 10,
        retry: RetryConfig {
            max_attempts: Some(max_attempts),
            ..Default::default()
        },
        ..Default::default()
    };
    let writer = BulkWriter::new(backend.clone(), config)?;

    for i in 0..total {
        writer.set(format!("doc-{i}"), fields(i))?;
    }
    let summary = writer.flush().await?;

    assert_eq!(summary.succeeded, total as u64);
    assert_eq!(summary.failed, 0);
    assert_eq!(backend.len(), total);
    assert!(writer.stats().retries > 0);
    assert!(backend.operations() <= total as u64 * u64::from(max_attempts));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_resource_exhausted_shrinks_budget() -> Result<()> {
    let backend = InMemoryBackend::new(Simulation {
        latency: Duration::from_millis(10),
        max_concurrent_commits: Some(2),
        contention: false,
    });
    let writer = BulkWriter::new(backend.clone(), with_batch_size(10))?;
    let initial = ThrottleConfig::default().initial;

    for i in 0..100 {
        writer.set(format!("doc-{i}"), fields(i))?;
    }
    let summary = writer.flush().await?;

    assert_eq!(summary.succeeded, 100);
    assert_eq!(summary.failed, 0);

    let state = writer.throttle_state().unwrap();
    assert!(state.lowest_budget < initial, "{state:?}");
    assert!(state.budget >= 1);
    assert!(writer.report().error_count > 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_budget_stays_within_bounds() -> Result<()> {
    let backend = InMemoryBackend::new(Simulation {
        latency: Duration::from_millis(10),
        ..Default::default()
    });
    let config = WriterConfig {
        max_batch_size: 5,
        throttle: ThrottleConfig {
            initial: 2,
            ceiling: 4,
            ..Default::default()
        },
        ..Default::default()
    };
    let writer = BulkWriter::new(backend.clone(), config)?;

    for i in 0..500 {
        writer.set(format!("doc-{i}"), fields(i))?;
    }
    writer.flush().await?;

    let state = writer.throttle_state().unwrap();
    assert_eq!(state.budget, 4);
    assert_eq!(backend.peak_in_flight(), 4);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_static_concurrency_without_throttling() -> Result<()> {
    let backend = InMemoryBackend::new(Simulation {
        latency: Duration::from_millis(10),
        ..Default::default()
    });
    let config = WriterConfig {
        max_batch_size: 5,
        static_concurrency: 3,
        throttle: ThrottleConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let writer = BulkWriter::new(backend.clone(), config)?;

    for i in 0..100 {
        writer.set(format!("doc-{i}"), fields(i))?;
    }
    let summary = writer.flush().await?;

    assert_eq!(summary.succeeded, 100);
    assert!(writer.throttle_state().is_none());
    assert_eq!(backend.peak_in_flight(), 3);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_attempts_are_surfaced() -> Result<()> {
    let hook = Arc::new(|_seq: u64, _write: &Write| {
        Some(OpError::new(ErrorKind::Unavailable, "always down"))
    });
    let backend = InMemoryBackend::new(Simulation::default()).with_fault(hook);
    let config = WriterConfig {
        retry: RetryConfig {
            max_attempts: Some(3),
            ..Default::default()
        },
        ..Default::default()
    };
    let writer = BulkWriter::new(backend.clone(), config)?;
    let mut failures = writer.failures().unwrap();

    for i in 0..10 {
        writer.set(format!("doc-{i}"), fields(i))?;
    }
    let summary = writer.flush().await?;

    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 10);
    assert_eq!(backend.operations(), 30);

    for _ in 0..10 {
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.reason, FailureReason::AttemptsExhausted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.error.kind, ErrorKind::Unavailable);
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_pending_retries() -> Result<()> {
    let hook = Arc::new(|_seq: u64, _write: &Write| {
        Some(OpError::new(ErrorKind::Aborted, "contention"))
    });
    let backend = InMemoryBackend::new(Simulation::default()).with_fault(hook);
    let writer = BulkWriter::new(backend.clone(), WriterConfig::default())?;
    let mut failures = writer.failures().unwrap();

    for i in 0..5 {
        writer.set(format!("doc-{i}"), fields(i))?;
    }

    // let the first attempt happen, then stop while the retries are waiting
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(backend.commits() >= 1);
    let summary = writer.shutdown().await;

    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 5);
    assert!(writer.counts().is_idle());
    while let Ok(failure) = failures.try_recv() {
        assert_eq!(failure.reason, FailureReason::Shutdown);
    }

    Ok(())
}
