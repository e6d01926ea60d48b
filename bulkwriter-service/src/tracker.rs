//! Bookkeeping of where every intent currently is.
//!
//! Every intent is in exactly one of the stages queued, in-flight, retry-pending, or resolved.
//! [`IntentTracker`] counts them and lets [`flush`](crate::BulkWriter::flush) wait until nothing
//! is outstanding anymore.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::intent::IntentId;

/// The unresolved stages an intent can be in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Stage {
    Queued,
    InFlight,
    RetryPending,
}

/// A snapshot of intent counts per stage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IntentCounts {
    /// Intents waiting in the queue.
    pub queued: usize,
    /// Intents that are part of a batch being committed.
    pub in_flight: usize,
    /// Intents waiting for their retry backoff to elapse.
    pub retry_pending: usize,
    /// Intents that were committed successfully.
    pub succeeded: u64,
    /// Intents given up on, for any [reason](crate::FailureReason).
    pub failed: u64,
}

impl IntentCounts {
    /// Returns `true` if no intent is queued, in flight, or waiting for a retry.
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.in_flight == 0 && self.retry_pending == 0
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    queued: usize,
    in_flight: HashSet<IntentId>,
    retry_pending: usize,
    succeeded: u64,
    failed: u64,
}

impl TrackerState {
    fn counts(&self) -> IntentCounts {
        IntentCounts {
            queued: self.queued,
            in_flight: self.in_flight.len(),
            retry_pending: self.retry_pending,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }

    fn leave(&mut self, stage: Stage, id: IntentId) {
        match stage {
            Stage::Queued => self.queued -= 1,
            Stage::InFlight => {
                let removed = self.in_flight.remove(&id);
                debug_assert!(removed, "intent {id} was not in flight");
            }
            Stage::RetryPending => self.retry_pending -= 1,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct IntentTracker {
    state: Mutex<TrackerState>,
    idle: Notify,
}

impl IntentTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn counts(&self) -> IntentCounts {
        self.state.lock().unwrap().counts()
    }

    pub(crate) fn enqueued(&self) {
        self.state.lock().unwrap().queued += 1;
    }

    /// Reverts [`enqueued`](Self::enqueued) for an intent the queue did not accept.
    pub(crate) fn withdrawn(&self) {
        self.update(|state| state.queued -= 1);
    }

    /// Moves the intents of a freshly formed batch from queued to in-flight.
    ///
    /// Panics in debug builds if an intent is already part of another in-flight batch.
    pub(crate) fn dispatched(&self, ids: impl IntoIterator<Item = IntentId>) {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            state.queued -= 1;
            let inserted = state.in_flight.insert(id);
            debug_assert!(inserted, "intent {id} dispatched twice");
        }
    }

    pub(crate) fn succeeded(&self, id: IntentId) {
        self.update(|state| {
            state.leave(Stage::InFlight, id);
            state.succeeded += 1;
        });
    }

    pub(crate) fn retry_scheduled(&self, id: IntentId) {
        self.update(|state| {
            state.leave(Stage::InFlight, id);
            state.retry_pending += 1;
        });
    }

    pub(crate) fn requeued(&self) {
        self.update(|state| {
            state.retry_pending -= 1;
            state.queued += 1;
        });
    }

    pub(crate) fn failed(&self, from: Stage, id: IntentId) {
        self.update(|state| {
            state.leave(from, id);
            state.failed += 1;
        });
    }

    fn update(&self, f: impl FnOnce(&mut TrackerState)) {
        let idle = {
            let mut state = self.state.lock().unwrap();
            f(&mut state);
            state.counts().is_idle()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Waits until no intent is queued, in flight, or pending a retry.
    pub(crate) async fn wait_idle(&self) -> IntentCounts {
        loop {
            let notified = self.idle.notified();
            let counts = self.counts();
            if counts.is_idle() {
                return counts;
            }
            notified.await;
        }
    }
}
