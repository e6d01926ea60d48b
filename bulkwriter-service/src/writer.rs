//! The [`BulkWriter`] facade.
//!
//! A background driver task owns the batching loop. It waits until a batch is worth sending, takes
//! a dispatch permit, drains the batch from the queue and commits it on a task of its own. Callers
//! only ever touch the queue and the bookkeeping.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::batcher::Batcher;
use crate::concurrency::Limiter;
use crate::config::WriterConfig;
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{Error, ErrorKind, OpError, Result};
use crate::intent::{Fields, IntentId, Write, WriteIntent};
use crate::queue::{IntentQueue, Pending};
use crate::reporter::{RunReport, ThroughputReporter};
use crate::retry::{Failure, FailureReason, RetryManager};
use crate::throttle::ThrottleState;
use crate::tracker::{IntentCounts, IntentTracker, Stage};

/// Result of [`BulkWriter::flush`] and [`BulkWriter::shutdown`].
///
/// Counts are totals since the writer was created.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushSummary {
    /// Intents committed successfully.
    pub succeeded: u64,
    /// Intents given up on. Each of them was delivered on the [failure
    /// channel](BulkWriter::failures) if it was open at that time.
    pub failed: u64,
}

impl From<IntentCounts> for FlushSummary {
    fn from(counts: IntentCounts) -> Self {
        Self {
            succeeded: counts.succeeded,
            failed: counts.failed,
        }
    }
}

/// Automatically batches individually submitted writes and commits them concurrently.
///
/// Writes are accepted with [`set`](Self::set), [`update`](Self::update), and
/// [`delete`](Self::delete), grouped into batches of up to
/// [`max_batch_size`](WriterConfig::max_batch_size) and committed against the [`Backend`] with
/// adaptive concurrency. Retryable failures are retried transparently. Intents that can not be
/// committed are delivered on the [failure channel](Self::failures).
///
/// Dropping the writer cancels it like [`shutdown`](Self::shutdown) without waiting.
#[derive(Debug)]
pub struct BulkWriter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    linger: Duration,
    queue: Arc<IntentQueue>,
    batcher: Arc<Batcher>,
    tracker: Arc<IntentTracker>,
    retry: Arc<RetryManager>,
    dispatcher: Dispatcher,
    reporter: Arc<ThroughputReporter>,
    wakeup: Arc<Notify>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    flushing: AtomicUsize,
    fatal: Mutex<Option<String>>,
}

impl BulkWriter {
    /// Creates a writer committing to `backend` and starts its driver task.
    ///
    /// The configuration is validated first. Must be called within a tokio runtime.
    pub fn new(backend: impl Backend, config: WriterConfig) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(IntentQueue::new(config.retry.order));
        let tracker = Arc::new(IntentTracker::new());
        let reporter = Arc::new(ThroughputReporter::new(config.report_window));
        let wakeup = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let batcher = Arc::new(Batcher::new(
            config.max_batch_size,
            config.max_in_flight_bytes.as_u64(),
        ));

        let retry = Arc::new(RetryManager::new(
            config.retry.clone(),
            Arc::clone(&queue),
            Arc::clone(&tracker),
            Arc::clone(&wakeup),
            shutdown.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Box::new(backend),
            Limiter::new(&config),
            Arc::clone(&batcher),
            Arc::clone(&retry),
            Arc::clone(&tracker),
            Arc::clone(&reporter),
        );

        tracing::debug!(
            backend = dispatcher.backend_name(),
            max_batch_size = config.max_batch_size,
            throttle = config.throttle.enabled,
            "starting bulk writer"
        );

        let inner = Arc::new(Inner {
            linger: config.linger,
            queue,
            batcher,
            tracker,
            retry,
            dispatcher,
            reporter,
            wakeup,
            shutdown,
            next_id: AtomicU64::new(0),
            flushing: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        });
        tokio::spawn(Arc::clone(&inner).run());

        Ok(Self { inner })
    }

    /// Accepts a write for dispatch and returns the identifier of its intent.
    ///
    /// Fails once the writer is shutting down or the backend turned out to be unreachable.
    pub fn enqueue(&self, write: Write) -> Result<IntentId> {
        let inner = &*self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(inner.closed_error());
        }

        let intent = WriteIntent::new(inner.next_id.fetch_add(1, Ordering::Relaxed), write);
        let id = intent.id();

        inner.tracker.enqueued();
        if inner.queue.push(Pending::fresh(intent)).is_err() {
            inner.tracker.withdrawn();
            return Err(inner.closed_error());
        }

        inner.wakeup.notify_one();
        Ok(id)
    }

    /// Creates or replaces the document at `key`.
    pub fn set(&self, key: impl Into<String>, fields: Fields) -> Result<IntentId> {
        self.enqueue(Write::set(key, fields))
    }

    /// Merges `fields` into the existing document at `key`.
    pub fn update(&self, key: impl Into<String>, fields: Fields) -> Result<IntentId> {
        self.enqueue(Write::update(key, fields))
    }

    /// Deletes the document at `key`.
    pub fn delete(&self, key: impl Into<String>) -> Result<IntentId> {
        self.enqueue(Write::delete(key))
    }

    /// Waits until every intent accepted so far is resolved.
    ///
    /// Partial batches are sent without waiting for the linger time. Failed intents do not make
    /// this fail, they are counted in the summary. An error is only returned if the backend was
    /// unreachable.
    pub async fn flush(&self) -> Result<FlushSummary> {
        let counts = {
            let _flushing = FlushGuard::new(&self.inner);
            self.inner.tracker.wait_idle().await
        };

        match self.inner.fatal_error() {
            Some(error) => Err(error),
            None => Ok(counts.into()),
        }
    }

    /// Stops the writer.
    ///
    /// No further writes are accepted and queued intents are failed. Batches already being
    /// committed complete, but their retryable failures are no longer retried. Returns once every
    /// intent is resolved.
    pub async fn shutdown(&self) -> FlushSummary {
        tracing::debug!(
            counts = ?self.counts(),
            batches_in_flight = self.inner.dispatcher.in_flight(),
            "shutting down bulk writer"
        );
        self.inner.stop();
        self.inner.tracker.wait_idle().await.into()
    }

    /// Opens the failure channel and returns its receiving end.
    ///
    /// Every intent given up on after this call is delivered here exactly once, together with its
    /// last error. Failures before the channel is opened, or after the receiver is dropped, are
    /// only counted. Returns `None` if the channel has already been opened.
    pub fn failures(&self) -> Option<mpsc::UnboundedReceiver<Failure>> {
        self.inner.retry.subscribe()
    }

    /// Changes the maximum batch size for all batches formed from now on.
    pub fn set_max_batch_size(&self, size: usize) -> Result<()> {
        self.inner.batcher.set_max_batch_size(size)?;
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// The current maximum batch size.
    pub fn max_batch_size(&self) -> usize {
        self.inner.batcher.max_batch_size()
    }

    /// Returns the aggregate report of this writer so far.
    pub fn report(&self) -> RunReport {
        let reporter = &self.inner.reporter;
        RunReport {
            batch_size: self.max_batch_size(),
            total_operations: reporter.total(),
            elapsed: reporter.elapsed(),
            average_qps: reporter.average_qps(),
            error_count: self.inner.dispatcher.stats().errors,
            failed: self.inner.tracker.counts().failed,
        }
    }

    /// Windowed throughput of committed operations.
    pub fn reporter(&self) -> &ThroughputReporter {
        &self.inner.reporter
    }

    /// State of the adaptive rate controller, or `None` if throttling is disabled.
    pub fn throttle_state(&self) -> Option<ThrottleState> {
        self.inner.dispatcher.throttle_state()
    }

    /// Number of intents per stage.
    pub fn counts(&self) -> IntentCounts {
        self.inner.tracker.counts()
    }

    /// Counters of batches and attempts dispatched so far.
    pub fn stats(&self) -> DispatchStats {
        self.inner.dispatcher.stats()
    }
}

impl Drop for BulkWriter {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        loop {
            let Some(oldest) = self.queue.front_enqueued_at() else {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                }
                continue;
            };

            let full = self.queue.len() >= self.batcher.max_batch_size();
            let flushing = self.flushing.load(Ordering::Acquire) > 0;
            let deadline = oldest + self.linger;
            if !full && !flushing && Instant::now() < deadline {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.dispatcher.acquire() => permit,
            };
            let Some(batch) = self.batcher.drain(&self.queue) else {
                drop(permit);
                if !self.queue.is_empty() {
                    // the in-flight byte budget is used up
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = self.batcher.released() => {}
                    }
                }
                continue;
            };

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = inner.dispatcher.dispatch_with(batch, permit).await {
                    inner.abort(error);
                }
            });
        }

        self.stop();
    }

    /// Cancels the writer and fails everything still waiting in the queue.
    fn stop(&self) {
        self.shutdown.cancel();

        let remaining = self.queue.close();
        if remaining.is_empty() {
            return;
        }

        tracing::debug!(count = remaining.len(), "failing queued intents");
        let error = OpError::new(
            ErrorKind::Unavailable,
            "bulk writer stopped before the write was committed",
        );
        for pending in remaining {
            self.retry.fail(
                pending.intent,
                pending.attempts,
                error.clone(),
                FailureReason::Shutdown,
                Stage::Queued,
            );
        }
    }

    fn abort(&self, error: Error) {
        let message = match error {
            Error::BackendUnreachable(message) => message,
            other => other.to_string(),
        };

        self.fatal.lock().unwrap().get_or_insert(message);
        self.stop();
    }

    fn fatal_error(&self) -> Option<Error> {
        let fatal = self.fatal.lock().unwrap();
        fatal.clone().map(Error::BackendUnreachable)
    }

    fn closed_error(&self) -> Error {
        self.fatal_error().unwrap_or(Error::ShuttingDown)
    }
}

/// Marks a flush as pending while alive, so partial batches are sent right away.
struct FlushGuard<'a> {
    inner: &'a Inner,
}

impl<'a> FlushGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        inner.flushing.fetch_add(1, Ordering::AcqRel);
        inner.wakeup.notify_one();
        Self { inner }
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.inner.flushing.fetch_sub(1, Ordering::AcqRel);
    }
}
