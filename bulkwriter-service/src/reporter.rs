//! Windowed throughput statistics.
//!
//! [`ThroughputReporter`] counts completed operations into fixed windows. Closed windows are
//! appended to a sequence that is never mutated again, and a cursor publishes how many of them
//! are complete, so readers only ever see whole windows.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// Completed operations within one closed window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThroughputSample {
    /// Start of the window, relative to the reporter's origin.
    pub start: Duration,
    /// End of the window, relative to the reporter's origin.
    pub end: Duration,
    /// Operations completed within the window.
    pub ops: u64,
}

impl ThroughputSample {
    /// Operations per second within this window.
    pub fn qps(&self) -> f64 {
        self.ops as f64 / (self.end - self.start).as_secs_f64()
    }
}

/// The aggregate result of one run of a [`BulkWriter`](crate::BulkWriter).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunReport {
    /// The maximum batch size in effect at the end of the run.
    pub batch_size: usize,
    /// Operations committed successfully.
    pub total_operations: u64,
    /// Time since the writer was created.
    pub elapsed: Duration,
    /// Committed operations per second over the whole run.
    pub average_qps: f64,
    /// Operation attempts that failed, including those that were retried.
    pub error_count: u64,
    /// Intents given up on.
    pub failed: u64,
}

#[derive(Debug)]
struct OpenWindow {
    index: u64,
    ops: u64,
}

/// Aggregates completion counts into fixed-size time windows.
#[derive(Debug)]
pub struct ThroughputReporter {
    origin: Instant,
    window: Duration,
    open: Mutex<OpenWindow>,
    closed: RwLock<Vec<ThroughputSample>>,
    cursor: AtomicUsize,
    total: AtomicU64,
}

impl ThroughputReporter {
    /// Creates a reporter with the given window size, starting now.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(window: Duration) -> Self {
        assert!(!window.is_zero(), "report window must not be zero");
        Self {
            origin: Instant::now(),
            window,
            open: Mutex::new(OpenWindow { index: 0, ops: 0 }),
            closed: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Records `ops` completed operations at the current time.
    pub fn record(&self, ops: u64) {
        self.total.fetch_add(ops, Ordering::Relaxed);
        let mut open = self.roll();
        open.ops += ops;
    }

    /// Total operations recorded since creation.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Time since creation.
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Operations per second averaged over the whole lifetime.
    pub fn average_qps(&self) -> f64 {
        qps(self.total(), self.elapsed())
    }

    /// Operations per second of the most recently closed window.
    pub fn current_qps(&self) -> f64 {
        drop(self.roll());
        self.with_closed(|samples| samples.last().map_or(0.0, ThroughputSample::qps))
    }

    /// Operations per second over the closed windows of the last `span`.
    ///
    /// The span is rounded up to whole windows. If fewer windows have closed so far, only the
    /// existing ones are taken into account.
    pub fn windowed_qps(&self, span: Duration) -> f64 {
        drop(self.roll());
        let windows = span.div_duration_f64(self.window).ceil().max(1.0) as usize;
        self.with_closed(|samples| {
            let recent = &samples[samples.len().saturating_sub(windows)..];
            let ops = recent.iter().map(|s| s.ops).sum();
            qps(ops, window_offset(self.window, recent.len() as u64))
        })
    }

    /// Returns all closed windows.
    pub fn samples(&self) -> Vec<ThroughputSample> {
        drop(self.roll());
        self.with_closed(<[_]>::to_vec)
    }

    fn with_closed<T>(&self, f: impl FnOnce(&[ThroughputSample]) -> T) -> T {
        let cursor = self.cursor.load(Ordering::Acquire);
        let closed = self.closed.read().unwrap();
        f(&closed[..cursor])
    }

    /// Closes every window that ended before now and returns the open one.
    fn roll(&self) -> std::sync::MutexGuard<'_, OpenWindow> {
        let index = (self.elapsed().as_nanos() / self.window.as_nanos()) as u64;
        let mut open = self.open.lock().unwrap();
        if index > open.index {
            let mut closed = self.closed.write().unwrap();
            for i in open.index..index {
                let ops = if i == open.index { open.ops } else { 0 };
                closed.push(ThroughputSample {
                    start: window_offset(self.window, i),
                    end: window_offset(self.window, i + 1),
                    ops,
                });
            }
            self.cursor.store(closed.len(), Ordering::Release);
            open.index = index;
            open.ops = 0;
        }
        open
    }
}

/// Start of the window at `index`, saturating at the largest representable offset.
fn window_offset(window: Duration, index: u64) -> Duration {
    let nanos = window.as_nanos().saturating_mul(u128::from(index));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn qps(ops: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    ops as f64 / elapsed.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn nothing_closed_yet() {
        let reporter = ThroughputReporter::new(WINDOW);
        reporter.record(10);

        assert_eq!(reporter.total(), 10);
        assert_eq!(reporter.current_qps(), 0.0);
        assert!(reporter.samples().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn windows_close_as_time_passes() {
        let reporter = ThroughputReporter::new(WINDOW);
        reporter.record(10);
        tokio::time::advance(WINDOW).await;
        reporter.record(20);
        tokio::time::advance(WINDOW * 2).await;

        let samples = reporter.samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].ops, 10);
        assert_eq!(samples[1].ops, 20);
        assert_eq!(samples[2].ops, 0);
        assert_eq!(samples[2].start, WINDOW * 2);
        assert_eq!(samples[2].end, WINDOW * 3);

        assert_eq!(reporter.current_qps(), 0.0);
        assert_eq!(reporter.windowed_qps(WINDOW * 2), 10.0);
        assert_eq!(reporter.windowed_qps(WINDOW * 10), 10.0);
        assert_eq!(reporter.average_qps(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn windowed_qps_rounds_span_up() {
        let reporter = ThroughputReporter::new(WINDOW);
        reporter.record(4);
        tokio::time::advance(WINDOW).await;
        reporter.record(8);
        tokio::time::advance(WINDOW).await;

        assert_eq!(reporter.current_qps(), 8.0);
        assert_eq!(reporter.windowed_qps(Duration::from_millis(1)), 8.0);
        assert_eq!(reporter.windowed_qps(Duration::from_millis(1500)), 6.0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writers_are_all_counted() {
        let reporter = std::sync::Arc::new(ThroughputReporter::new(WINDOW));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let reporter = reporter.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        reporter.record(1);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        tokio::time::advance(WINDOW).await;

        assert_eq!(reporter.total(), 800);
        let recorded: u64 = reporter.samples().iter().map(|s| s.ops).sum();
        assert_eq!(recorded, 800);
    }

    #[test]
    fn window_offsets_do_not_wrap() {
        let window = Duration::from_millis(1);
        // past u32::MAX windows, about 50 days of 1ms windows
        let index = u64::from(u32::MAX) + 10;
        assert_eq!(
            window_offset(window, index),
            Duration::from_millis(u64::from(u32::MAX) + 10)
        );
        assert_eq!(window_offset(WINDOW, 3), Duration::from_secs(3));
        assert_eq!(
            window_offset(WINDOW, u64::MAX),
            Duration::from_nanos(u64::MAX)
        );
    }
}
