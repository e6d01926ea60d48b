//! The ordered buffer of intents waiting to be batched.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::time::Instant;

use crate::intent::WriteIntent;
use crate::retry::RetryOrder;

/// An intent sitting in the queue together with the number of attempts it already used.
#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) intent: WriteIntent,
    pub(crate) attempts: u32,
}

impl Pending {
    pub(crate) fn fresh(intent: WriteIntent) -> Self {
        Self {
            intent,
            attempts: 0,
        }
    }

    fn is_retry(&self) -> bool {
        self.attempts > 0
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Pending>,
    closed: bool,
}

/// FIFO queue shared by callers, retry timers, and the batch driver.
///
/// Once [closed](Self::close), the queue rejects every insertion, handing the entry back to the
/// caller so it can be resolved another way.
#[derive(Debug)]
pub(crate) struct IntentQueue {
    state: Mutex<QueueState>,
    order: RetryOrder,
}

impl IntentQueue {
    pub(crate) fn new(order: RetryOrder) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            order,
        }
    }

    /// Appends a fresh intent at the back.
    pub(crate) fn push(&self, pending: Pending) -> Result<(), Pending> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(pending);
        }
        state.entries.push_back(pending);
        Ok(())
    }

    /// Puts a retried intent back into the queue according to the configured [`RetryOrder`].
    pub(crate) fn requeue(&self, pending: Pending) -> Result<(), Pending> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(pending);
        }

        let id = pending.intent.id();
        let position = match self.order {
            RetryOrder::EnqueueTime => state.entries.partition_point(|p| p.intent.id() < id),
            RetryOrder::RetriesFirst => state
                .entries
                .partition_point(|p| p.is_retry() && p.intent.id() < id),
        };
        state.entries.insert(position, pending);
        Ok(())
    }

    /// Removes up to `max` entries from the front while `accept` agrees.
    ///
    /// `accept` sees every candidate before it is removed. Stops at the first entry it rejects,
    /// which stays at the front.
    pub(crate) fn pop_while(
        &self,
        max: usize,
        mut accept: impl FnMut(&Pending) -> bool,
    ) -> Vec<Pending> {
        let mut state = self.state.lock().unwrap();
        let mut taken = Vec::with_capacity(max.min(state.entries.len()));
        while taken.len() < max {
            let Some(front) = state.entries.front() else {
                break;
            };
            if !accept(front) {
                break;
            }
            taken.extend(state.entries.pop_front());
        }
        taken
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().unwrap().entries.is_empty()
    }

    /// Enqueue time of the entry at the front, which is the oldest one.
    pub(crate) fn front_enqueued_at(&self) -> Option<Instant> {
        let state = self.state.lock().unwrap();
        state.entries.front().map(|p| p.intent.enqueued_at())
    }

    /// Closes the queue and returns everything that was still waiting.
    pub(crate) fn close(&self) -> Vec<Pending> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.entries.drain(..).collect()
    }
}
