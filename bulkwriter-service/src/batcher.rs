//! Groups queued intents into size-bounded batches.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::intent::{IntentId, WriteIntent};
use crate::queue::{IntentQueue, Pending};

/// Identifier of a [`Batch`], unique within one writer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BatchId(u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// An ordered group of intents that is committed to the backend in one call.
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    intents: Vec<WriteIntent>,
    attempts: Vec<u32>,
    bytes: u64,
    formed_at: Instant,
}

impl Batch {
    fn from_pending(id: BatchId, pending: Vec<Pending>, bytes: u64) -> Self {
        let (intents, attempts) = pending.into_iter().map(|p| (p.intent, p.attempts)).unzip();
        Self {
            id,
            intents,
            attempts,
            bytes,
            formed_at: Instant::now(),
        }
    }

    /// The batch identifier.
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// The intents of this batch, in queue order.
    pub fn intents(&self) -> &[WriteIntent] {
        &self.intents
    }

    /// Number of intents in this batch.
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    /// Returns `true` if the batch carries no intents.
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Estimated payload size of all intents, see [`Write::size_hint`](crate::Write::size_hint).
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// When the batch was formed from the queue.
    pub fn formed_at(&self) -> Instant {
        self.formed_at
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = IntentId> + '_ {
        self.intents.iter().map(WriteIntent::id)
    }

    /// Splits the batch into its intents, each paired with the attempts used before this one.
    pub(crate) fn into_pending(self) -> impl Iterator<Item = Pending> {
        self.intents
            .into_iter()
            .zip(self.attempts)
            .map(|(intent, attempts)| Pending { intent, attempts })
    }
}

/// Forms batches from the front of the [`IntentQueue`].
///
/// The maximum batch size can be changed at any time. A change applies to the next batch that is
/// formed, batches already in flight keep their size.
///
/// The bytes of every formed batch count against the in-flight byte budget until the batch is
/// [released](Self::release).
#[derive(Debug)]
pub(crate) struct Batcher {
    max_batch_size: AtomicUsize,
    max_in_flight_bytes: u64,
    in_flight_bytes: Mutex<u64>,
    released: Notify,
    next_id: AtomicU64,
}

impl Batcher {
    pub(crate) fn new(max_batch_size: usize, max_in_flight_bytes: u64) -> Self {
        Self {
            max_batch_size: AtomicUsize::new(max_batch_size),
            max_in_flight_bytes,
            in_flight_bytes: Mutex::new(0),
            released: Notify::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn max_batch_size(&self) -> usize {
        self.max_batch_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_batch_size(&self, size: usize) -> Result<(), ConfigError> {
        if size == 0 {
            return Err(ConfigError::new("max_batch_size", "must be at least 1"));
        }
        self.max_batch_size.store(size, Ordering::Relaxed);
        Ok(())
    }

    /// Takes the next batch from the front of the queue.
    ///
    /// Stops at the maximum batch size or once the next intent would push the bytes in flight
    /// over the budget. An intent larger than the whole budget is taken alone once nothing else is
    /// in flight. Returns `None` without waiting if the queue is empty or the budget is used up.
    pub(crate) fn drain(&self, queue: &IntentQueue) -> Option<Batch> {
        let max_size = self.max_batch_size();
        let mut in_flight = self.in_flight_bytes.lock().unwrap();
        let idle = *in_flight == 0;

        let mut bytes = 0u64;
        let mut count = 0;
        let pending = queue.pop_while(max_size, |p| {
            let size = p.intent.write().size_hint();
            let total = in_flight.saturating_add(bytes).saturating_add(size);
            if total > self.max_in_flight_bytes && !(idle && count == 0) {
                return false;
            }
            bytes += size;
            count += 1;
            true
        });

        if pending.is_empty() {
            return None;
        }

        *in_flight += bytes;
        let id = BatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Some(Batch::from_pending(id, pending, bytes))
    }

    /// Returns the bytes of a resolved batch to the budget and wakes a waiting driver.
    pub(crate) fn release(&self, bytes: u64) {
        {
            let mut in_flight = self.in_flight_bytes.lock().unwrap();
            *in_flight = in_flight.saturating_sub(bytes);
        }
        self.released.notify_one();
    }

    /// Waits until a batch releases its bytes.
    ///
    /// A release that happened while nobody was waiting completes the next call immediately.
    pub(crate) async fn released(&self) {
        self.released.notified().await;
    }

    /// Estimated bytes of all batches formed and not yet released.
    pub(crate) fn in_flight_bytes(&self) -> u64 {
        *self.in_flight_bytes.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::intent::{Fields, Write};
    use crate::retry::RetryOrder;

    fn queue_with(count: u64, value: &str) -> IntentQueue {
        let queue = IntentQueue::new(RetryOrder::EnqueueTime);
        for id in 0..count {
            let mut fields = Fields::new();
            fields.insert("v".into(), json!(value));
            let intent = WriteIntent::new(id, Write::set(format!("{id:03}"), fields));
            queue.push(Pending::fresh(intent)).unwrap();
        }
        queue
    }

    #[test]
    fn forms_ceil_n_over_b_batches() {
        for (count, size, expected) in [(300, 10, 30), (101, 10, 11), (7, 500, 1), (1, 1, 1)] {
            let queue = queue_with(count, "x");
            let batcher = Batcher::new(size, u64::MAX);

            let mut batches = Vec::new();
            while let Some(batch) = batcher.drain(&queue) {
                batches.push(batch);
            }

            assert_eq!(batches.len(), expected, "{count} intents / size {size}");
            assert!(batches.iter().all(|b| b.len() <= size));
            let total: usize = batches.iter().map(Batch::len).sum();
            assert_eq!(total, count as usize);
        }
    }

    #[test]
    fn drain_on_empty_queue_returns_none() {
        let queue = queue_with(0, "x");
        let batcher = Batcher::new(10, u64::MAX);
        assert!(batcher.drain(&queue).is_none());
    }

    #[test]
    fn batches_keep_fifo_order() {
        let queue = queue_with(5, "x");
        let batcher = Batcher::new(3, u64::MAX);

        let first = batcher.drain(&queue).unwrap();
        let second = batcher.drain(&queue).unwrap();
        let keys = |b: &Batch| {
            b.intents()
                .iter()
                .map(|i| i.write().key.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&first), ["000", "001", "002"]);
        assert_eq!(keys(&second), ["003", "004"]);
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn size_change_applies_to_next_batch() {
        let queue = queue_with(10, "x");
        let batcher = Batcher::new(4, u64::MAX);

        let first = batcher.drain(&queue).unwrap();
        batcher.set_max_batch_size(2).unwrap();
        let second = batcher.drain(&queue).unwrap();

        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 2);
        assert!(batcher.set_max_batch_size(0).is_err());
        assert_eq!(batcher.max_batch_size(), 2);
    }

    #[test]
    fn byte_budget_limits_batch() {
        // every write is 3 (key) + 1 (field name) + 10 (value) = 14 bytes
        let queue = queue_with(10, "0123456789");
        let batcher = Batcher::new(100, 30);

        let batch = batcher.drain(&queue).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.bytes(), 28);
        assert_eq!(batcher.in_flight_bytes(), 28);
    }

    #[test]
    fn byte_budget_spans_batches_in_flight() {
        let queue = queue_with(10, "0123456789");
        let batcher = Batcher::new(100, 30);

        let first = batcher.drain(&queue).unwrap();
        assert!(batcher.drain(&queue).is_none());
        assert_eq!(queue.len(), 8);

        batcher.release(first.bytes());
        assert_eq!(batcher.in_flight_bytes(), 0);
        assert_eq!(batcher.drain(&queue).unwrap().len(), 2);
    }

    #[test]
    fn oversized_intent_waits_until_nothing_is_in_flight() {
        let queue = queue_with(3, "0123456789");
        let batcher = Batcher::new(100, 5);

        let first = batcher.drain(&queue).unwrap();
        assert_eq!(first.len(), 1);
        assert!(batcher.drain(&queue).is_none());

        batcher.release(first.bytes());
        assert_eq!(batcher.drain(&queue).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_is_not_lost_without_waiter() {
        let queue = queue_with(1, "x");
        let batcher = Batcher::new(10, u64::MAX);
        let batch = batcher.drain(&queue).unwrap();

        batcher.release(batch.bytes());
        tokio::time::timeout(std::time::Duration::from_secs(1), batcher.released())
            .await
            .unwrap();
    }
}
