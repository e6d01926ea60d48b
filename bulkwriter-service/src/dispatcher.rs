//! Commits batches against the backend and routes the per-intent results.
//!
//! Every batch holds one [`DispatchPermit`] from the start of its commit until all of its intents
//! have been resolved or handed to the retry manager. Congestion feedback reaches the limiter while
//! the permit is still held. The batch's bytes are returned to the [`Batcher`] budget at the same
//! point.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{BoxedBackend, OpResult};
use crate::batcher::{Batch, Batcher};
use crate::concurrency::{DispatchPermit, Limiter};
use crate::error::{CommitError, Error, ErrorKind, OpError, Result};
use crate::reporter::ThroughputReporter;
use crate::retry::{FailureReason, IntentOutcome, RetryManager};
use crate::throttle::ThrottleState;
use crate::tracker::{IntentTracker, Stage};

/// Counters of the work done by the dispatcher.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchStats {
    /// Batches committed, including retried intents in later batches.
    pub batches: u64,
    /// Operations submitted to the backend, counting every attempt.
    pub operations: u64,
    /// Operation attempts that failed, retryable or not.
    pub errors: u64,
    /// Retries scheduled.
    pub retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    operations: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    backend: BoxedBackend,
    limiter: Limiter,
    batcher: Arc<Batcher>,
    retry: Arc<RetryManager>,
    tracker: Arc<IntentTracker>,
    reporter: Arc<ThroughputReporter>,
    counters: Counters,
}

impl Dispatcher {
    pub(crate) fn new(
        backend: BoxedBackend,
        limiter: Limiter,
        batcher: Arc<Batcher>,
        retry: Arc<RetryManager>,
        tracker: Arc<IntentTracker>,
        reporter: Arc<ThroughputReporter>,
    ) -> Self {
        Self {
            backend,
            limiter,
            batcher,
            retry,
            tracker,
            reporter,
            counters: Counters::default(),
        }
    }

    pub(crate) fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        DispatchStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            operations: self.counters.operations.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            retries: self.retry.retries(),
        }
    }

    pub(crate) fn throttle_state(&self) -> Option<ThrottleState> {
        self.limiter.throttle_state()
    }

    /// Number of batches currently being committed.
    pub(crate) fn in_flight(&self) -> usize {
        self.limiter.in_use()
    }

    /// Waits for the right to commit one batch.
    pub(crate) async fn acquire(&self) -> DispatchPermit {
        self.limiter.acquire().await
    }

    /// Acquires a permit and commits the batch.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) async fn dispatch(&self, batch: Batch) -> Result<Vec<IntentOutcome>> {
        let permit = self.acquire().await;
        self.dispatch_with(batch, permit).await
    }

    /// Commits the batch under an already acquired permit.
    ///
    /// Succeeded intents are resolved, failed ones go through the retry manager. Returns an error
    /// only if the backend could not be reached, in which case all intents of the batch have been
    /// resolved as failures.
    pub(crate) async fn dispatch_with(
        &self,
        batch: Batch,
        permit: DispatchPermit,
    ) -> Result<Vec<IntentOutcome>> {
        let bytes = batch.bytes();
        self.tracker.dispatched(batch.ids());
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .operations
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        tracing::debug!(batch = %batch.id(), size = batch.len(), "dispatching batch");

        let results = match self.backend.commit(batch.intents()).await {
            Ok(results) if results.len() == batch.len() => results,
            Ok(results) => {
                tracing::warn!(
                    batch = %batch.id(),
                    expected = batch.len(),
                    actual = results.len(),
                    "backend returned mismatched results"
                );
                let error = OpError::new(
                    ErrorKind::Unavailable,
                    format!("expected {} results, got {}", batch.len(), results.len()),
                );
                vec![Err(error); batch.len()]
            }
            Err(CommitError::Rejected(error)) => {
                tracing::debug!(batch = %batch.id(), error = %error, "batch rejected");
                vec![Err(error); batch.len()]
            }
            Err(CommitError::Unreachable { context, cause }) => {
                tracing::error!(
                    error = cause.as_ref() as &dyn std::error::Error,
                    backend = self.backend.name(),
                    "{context}"
                );
                let message = match cause.source() {
                    Some(source) => format!("{context}: {cause}: {source}"),
                    None => format!("{context}: {cause}"),
                };
                self.abandon(batch, &message);
                drop(permit);
                self.batcher.release(bytes);
                return Err(Error::BackendUnreachable(message));
            }
        };

        let congested = results
            .iter()
            .any(|r| r.as_ref().is_err_and(|e| e.kind.is_congestion()));
        if congested {
            self.limiter.on_congestion();
        } else {
            self.limiter.on_success();
        }

        let outcomes = self.resolve(batch, results);
        drop(permit);
        self.batcher.release(bytes);
        Ok(outcomes)
    }

    fn resolve(&self, batch: Batch, results: Vec<OpResult>) -> Vec<IntentOutcome> {
        let mut succeeded = 0;
        let outcomes = batch
            .into_pending()
            .zip(results)
            .map(|(pending, result)| match result {
                Ok(()) => {
                    succeeded += 1;
                    let id = pending.intent.id();
                    self.tracker.succeeded(id);
                    IntentOutcome::Succeeded(id)
                }
                Err(error) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.retry.handle_failure(pending, error)
                }
            })
            .collect();

        if succeeded > 0 {
            self.reporter.record(succeeded);
        }
        outcomes
    }

    /// Resolves every intent of a batch that never reached the backend.
    fn abandon(&self, batch: Batch, message: &str) {
        let error = OpError::new(ErrorKind::Unavailable, message);
        for pending in batch.into_pending() {
            self.retry.fail(
                pending.intent,
                pending.attempts + 1,
                error.clone(),
                FailureReason::Shutdown,
                Stage::InFlight,
            );
        }
    }
}
