//! Failure classification, exponential backoff, and requeueing of retryable intents.
//!
//! Retryable failures never leave this module: the intent waits for its backoff and re-enters the
//! same queue as fresh intents. Everything else becomes a [`Failure`] that is delivered to the
//! caller on a single channel. The channel only exists once the caller subscribed to it, failures
//! before that are counted and dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, ErrorKind, OpError};
use crate::intent::{IntentId, WriteIntent};
use crate::queue::{IntentQueue, Pending};
use crate::tracker::{IntentTracker, Stage};

/// Whether a failed operation may be attempted again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// The failure is transient, the operation is retried after a backoff.
    Retryable,
    /// The operation can never succeed and is surfaced to the caller.
    Terminal,
}

/// Classifies a backend error kind.
pub fn classify(kind: ErrorKind) -> Disposition {
    match kind {
        ErrorKind::Aborted | ErrorKind::ResourceExhausted | ErrorKind::Unavailable => {
            Disposition::Retryable
        }
        ErrorKind::InvalidArgument | ErrorKind::PermissionDenied | ErrorKind::NotFound => {
            Disposition::Terminal
        }
    }
}

/// Where retried intents re-enter the queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOrder {
    /// Retries are placed by their original enqueue time, ahead of anything enqueued later.
    #[default]
    EnqueueTime,
    /// Retries are placed ahead of all fresh intents.
    RetriesFirst,
}

/// Backoff and attempt limits for retryable failures.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry. Doubles with every further attempt.
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Upper bound for a single backoff delay.
    #[serde(with = "humantime_serde")]
    pub cap: Duration,
    /// Relative jitter applied to every delay, from `0.0` (none) to `1.0` (up to ±100%).
    pub jitter: f64,
    /// Total number of attempts per intent, including the first one.
    ///
    /// Defaults to `None`, meaning retryable failures are retried until they succeed.
    pub max_attempts: Option<u32>,
    /// Where retried intents re-enter the queue.
    pub order: RetryOrder,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            cap: Duration::from_secs(5),
            jitter: 0.3,
            max_attempts: None,
            order: RetryOrder::default(),
        }
    }
}

impl RetryConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.base.is_zero() {
            return Err(ConfigError::new("retry.base", "must be greater than zero"));
        }
        if self.cap < self.base {
            return Err(ConfigError::new(
                "retry.cap",
                format!("must not be smaller than base ({:?})", self.base),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::new("retry.jitter", "must be within 0.0..=1.0"));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::new("retry.max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

/// Why an intent was given up on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureReason {
    /// The backend reported an error that cannot be retried.
    Terminal,
    /// The error was retryable, but the intent used up all its attempts.
    AttemptsExhausted,
    /// The writer shut down before the intent could be committed.
    Shutdown,
}

/// An intent that will not be committed, together with the last error it saw.
#[derive(Clone, Debug)]
pub struct Failure {
    /// The original intent.
    pub intent: WriteIntent,
    /// The last error reported for this intent.
    pub error: OpError,
    /// The number of commit attempts made.
    pub attempts: u32,
    /// Why the intent was given up on.
    pub reason: FailureReason,
}

/// An intent waiting for its backoff to elapse.
#[derive(Debug)]
pub struct RetryRecord {
    /// The intent to retry.
    pub intent: WriteIntent,
    /// Attempts made so far.
    pub attempts: u32,
    /// The earliest time the intent may be queued again.
    pub next_eligible: Instant,
    /// The error that caused the retry.
    pub last_error: OpError,
}

/// What happened to an intent after its commit attempt.
#[derive(Debug)]
pub enum IntentOutcome {
    /// The intent was committed.
    Succeeded(IntentId),
    /// The intent failed with a retryable error and will be attempted again after `delay`.
    Retrying {
        /// The intent.
        id: IntentId,
        /// Attempts made so far.
        attempts: u32,
        /// The backoff before the intent re-enters the queue.
        delay: Duration,
    },
    /// The intent was given up on.
    Failed(Failure),
}

/// The sending side of the failure channel, created on the first subscription.
#[derive(Debug, Default)]
struct FailureChannel {
    sender: Mutex<Option<mpsc::UnboundedSender<Failure>>>,
    subscribed: AtomicBool,
}

impl FailureChannel {
    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<Failure>> {
        let mut sender = self.sender.lock().unwrap();
        if self.subscribed.swap(true, Ordering::Relaxed) {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *sender = Some(tx);
        Some(rx)
    }

    fn send(&self, failure: &Failure) {
        let mut sender = self.sender.lock().unwrap();
        let Some(tx) = sender.as_ref() else {
            return;
        };
        if tx.send(failure.clone()).is_err() {
            // the subscriber went away
            *sender = None;
        }
    }
}

/// Applies the retry policy to failed intents.
#[derive(Debug)]
pub(crate) struct RetryManager {
    config: RetryConfig,
    rng: Mutex<SmallRng>,
    queue: Arc<IntentQueue>,
    tracker: Arc<IntentTracker>,
    failures: FailureChannel,
    wakeup: Arc<Notify>,
    shutdown: CancellationToken,
    retries: AtomicU64,
}

impl RetryManager {
    pub(crate) fn new(
        config: RetryConfig,
        queue: Arc<IntentQueue>,
        tracker: Arc<IntentTracker>,
        wakeup: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            rng: Mutex::new(SmallRng::from_os_rng()),
            queue,
            tracker,
            failures: FailureChannel::default(),
            wakeup,
            shutdown,
            retries: AtomicU64::new(0),
        }
    }

    /// Opens the failure channel. Returns `None` on every call after the first.
    pub(crate) fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<Failure>> {
        self.failures.subscribe()
    }

    /// Number of retries scheduled so far.
    pub(crate) fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Computes the backoff before attempt `attempts + 1`.
    pub(crate) fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self.config.base.saturating_mul(1 << exponent);
        let jitter = self.config.jitter;
        let factor = 1.0 + self.rng.lock().unwrap().random_range(-jitter..=jitter);
        delay.min(self.config.cap).mul_f64(factor).min(self.config.cap)
    }

    /// Decides the fate of an in-flight intent whose latest attempt failed with `error`.
    pub(crate) fn handle_failure(self: &Arc<Self>, pending: Pending, error: OpError) -> IntentOutcome {
        let attempts = pending.attempts + 1;
        let intent = pending.intent;

        let reason = if classify(error.kind) == Disposition::Terminal {
            Some(FailureReason::Terminal)
        } else if self.config.max_attempts.is_some_and(|max| attempts >= max) {
            Some(FailureReason::AttemptsExhausted)
        } else if self.shutdown.is_cancelled() {
            Some(FailureReason::Shutdown)
        } else {
            None
        };

        if let Some(reason) = reason {
            let failure = self.fail(intent, attempts, error, reason, Stage::InFlight);
            return IntentOutcome::Failed(failure);
        }

        let id = intent.id();
        let delay = self.backoff(attempts);
        tracing::debug!(intent = %id, attempts, ?delay, error = %error, "scheduling retry");

        self.retries.fetch_add(1, Ordering::Relaxed);
        self.tracker.retry_scheduled(id);
        Arc::clone(self).schedule(RetryRecord {
            intent,
            attempts,
            next_eligible: Instant::now() + delay,
            last_error: error,
        });

        IntentOutcome::Retrying {
            id,
            attempts,
            delay,
        }
    }

    /// Resolves an intent as failed and delivers it to the failure channel, if subscribed.
    pub(crate) fn fail(
        &self,
        intent: WriteIntent,
        attempts: u32,
        error: OpError,
        reason: FailureReason,
        from: Stage,
    ) -> Failure {
        if reason != FailureReason::Shutdown {
            tracing::warn!(
                intent = %intent.id(),
                key = %intent.write().key,
                attempts,
                ?reason,
                error = %error,
                "write failed"
            );
        }

        let failure = Failure {
            intent,
            error,
            attempts,
            reason,
        };
        self.failures.send(&failure);
        self.tracker.failed(from, failure.intent.id());
        failure
    }

    fn schedule(self: Arc<Self>, record: RetryRecord) {
        tokio::spawn(async move {
            let cancelled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => true,
                _ = tokio::time::sleep_until(record.next_eligible) => false,
            };

            let RetryRecord {
                intent,
                attempts,
                last_error,
                ..
            } = record;

            if cancelled {
                self.fail(intent, attempts, last_error, FailureReason::Shutdown, Stage::RetryPending);
                return;
            }

            self.tracker.requeued();
            match self.queue.requeue(Pending { intent, attempts }) {
                Ok(()) => self.wakeup.notify_one(),
                Err(pending) => {
                    self.fail(
                        pending.intent,
                        attempts,
                        last_error,
                        FailureReason::Shutdown,
                        Stage::Queued,
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Write;

    fn manager(config: RetryConfig) -> (Arc<RetryManager>, mpsc::UnboundedReceiver<Failure>) {
        let manager = RetryManager::new(
            config,
            Arc::new(IntentQueue::new(RetryOrder::EnqueueTime)),
            Arc::new(IntentTracker::new()),
            Arc::new(Notify::new()),
            CancellationToken::new(),
        );
        let rx = manager.subscribe().unwrap();
        (Arc::new(manager), rx)
    }

    fn in_flight(manager: &RetryManager, id: u64, attempts: u32) -> Pending {
        manager.tracker.enqueued();
        manager.tracker.dispatched([IntentId(id)]);
        Pending {
            intent: WriteIntent::new(id, Write::delete(format!("doc-{id}"))),
            attempts,
        }
    }

    #[test]
    fn classifies_error_kinds() {
        assert_eq!(classify(ErrorKind::Aborted), Disposition::Retryable);
        assert_eq!(classify(ErrorKind::ResourceExhausted), Disposition::Retryable);
        assert_eq!(classify(ErrorKind::Unavailable), Disposition::Retryable);
        assert_eq!(classify(ErrorKind::InvalidArgument), Disposition::Terminal);
        assert_eq!(classify(ErrorKind::PermissionDenied), Disposition::Terminal);
        assert_eq!(classify(ErrorKind::NotFound), Disposition::Terminal);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let (manager, _rx) = manager(RetryConfig {
            jitter: 0.0,
            ..Default::default()
        });
        assert_eq!(manager.backoff(1), Duration::from_millis(50));
        assert_eq!(manager.backoff(2), Duration::from_millis(100));
        assert_eq!(manager.backoff(4), Duration::from_millis(400));
        assert_eq!(manager.backoff(10), Duration::from_secs(5));
        assert_eq!(manager.backoff(1000), Duration::from_secs(5));
    }

    #[test]
    fn backoff_jitter_stays_in_range() {
        let (manager, _rx) = manager(RetryConfig {
            jitter: 0.5,
            ..Default::default()
        });
        for _ in 0..100 {
            let delay = manager.backoff(3);
            assert!(delay >= Duration::from_millis(100), "{delay:?}");
            assert!(delay <= Duration::from_millis(300), "{delay:?}");
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let invalid = [
            RetryConfig {
                base: Duration::ZERO,
                ..Default::default()
            },
            RetryConfig {
                cap: Duration::from_millis(1),
                ..Default::default()
            },
            RetryConfig {
                jitter: 1.5,
                ..Default::default()
            },
            RetryConfig {
                max_attempts: Some(0),
                ..Default::default()
            },
        ];
        for config in invalid {
            assert!(config.validate().is_err(), "{config:?}");
        }
        assert!(RetryConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn terminal_errors_are_surfaced_immediately() {
        let (manager, mut rx) = manager(RetryConfig::default());
        let pending = in_flight(&manager, 1, 0);

        let outcome = manager.handle_failure(pending, OpError::new(ErrorKind::NotFound, "missing"));
        assert!(matches!(outcome, IntentOutcome::Failed(_)));

        let failure = rx.try_recv().unwrap();
        assert_eq!(failure.reason, FailureReason::Terminal);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.error.kind, ErrorKind::NotFound);
        assert_eq!(manager.tracker.counts().failed, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_become_failures() {
        let (manager, mut rx) = manager(RetryConfig {
            max_attempts: Some(3),
            ..Default::default()
        });
        let pending = in_flight(&manager, 1, 2);

        manager.handle_failure(pending, OpError::new(ErrorKind::Aborted, "contention"));

        let failure = rx.try_recv().unwrap();
        assert_eq!(failure.reason, FailureReason::AttemptsExhausted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(manager.retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_requeue_after_backoff() {
        let (manager, mut rx) = manager(RetryConfig {
            jitter: 0.0,
            ..Default::default()
        });
        let pending = in_flight(&manager, 1, 0);

        let outcome =
            manager.handle_failure(pending, OpError::new(ErrorKind::Unavailable, "try later"));
        let IntentOutcome::Retrying { delay, attempts, .. } = outcome else {
            panic!("expected a retry, got {outcome:?}");
        };
        assert_eq!(delay, Duration::from_millis(50));
        assert_eq!(attempts, 1);
        assert_eq!(manager.tracker.counts().retry_pending, 1);
        assert_eq!(manager.queue.len(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let counts = manager.tracker.counts();
        assert_eq!(counts.retry_pending, 0);
        assert_eq!(counts.queued, 1);
        assert_eq!(manager.queue.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_pending_retries() {
        let (manager, mut rx) = manager(RetryConfig::default());
        let pending = in_flight(&manager, 1, 0);

        manager.handle_failure(pending, OpError::new(ErrorKind::Aborted, "contention"));
        manager.shutdown.cancel();
        tokio::task::yield_now().await;

        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.reason, FailureReason::Shutdown);
        assert!(manager.tracker.counts().is_idle());
        assert_eq!(manager.queue.len(), 0);
    }

    #[tokio::test]
    async fn failures_before_subscription_are_dropped() {
        let manager = Arc::new(RetryManager::new(
            RetryConfig::default(),
            Arc::new(IntentQueue::new(RetryOrder::EnqueueTime)),
            Arc::new(IntentTracker::new()),
            Arc::new(Notify::new()),
            CancellationToken::new(),
        ));
        for id in 0..100 {
            let pending = in_flight(&manager, id, 0);
            manager.handle_failure(pending, OpError::new(ErrorKind::NotFound, "missing"));
        }
        assert_eq!(manager.tracker.counts().failed, 100);

        let mut rx = manager.subscribe().unwrap();
        assert!(rx.try_recv().is_err());
        assert!(manager.subscribe().is_none());

        let pending = in_flight(&manager, 100, 0);
        manager.handle_failure(pending, OpError::new(ErrorKind::NotFound, "missing"));
        assert_eq!(rx.try_recv().unwrap().intent.id(), IntentId(100));
    }
}
