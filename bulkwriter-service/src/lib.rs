//! Adaptive batched writes against a rate-limited document store.
//!
//! The entry point is [`BulkWriter`]. It accepts individual write intents, groups them into
//! size-bounded batches and commits those concurrently against a [`Backend`]. How many batches may
//! be in flight is decided by an additive-increase / multiplicative-decrease rate controller that
//! reacts to contention and quota errors reported by the backend.
//!
//! # Lifecycle of an intent
//!
//! Every intent is in exactly one of these stages at any time:
//!
//! - **queued**: waiting in the FIFO queue for the next batch,
//! - **in flight**: part of exactly one batch being committed,
//! - **retry pending**: failed with a retryable error and waiting for its backoff,
//! - **resolved**: committed, or given up on and delivered on the [failure
//!   channel](BulkWriter::failures).
//!
//! Retried intents re-enter the same queue as fresh ones. [`BulkWriter::flush`] waits until
//! nothing is queued, in flight or pending a retry.
//!
//! # Errors
//!
//! Failed writes are data, not errors: they are counted in the [`FlushSummary`] and delivered as
//! [`Failure`]s. Only an invalid [`WriterConfig`] and an unreachable backend surface as [`Error`].
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod backend;
mod batcher;
mod concurrency;
mod config;
mod dispatcher;
mod error;
mod intent;
mod queue;
mod reporter;
mod retry;
mod throttle;
mod tracker;
mod writer;

pub use backend::*;
pub use batcher::{Batch, BatchId};
pub use concurrency::DispatchPermit;
pub use config::WriterConfig;
pub use dispatcher::DispatchStats;
pub use error::*;
pub use intent::*;
pub use reporter::{RunReport, ThroughputReporter, ThroughputSample};
pub use retry::{
    Disposition, Failure, FailureReason, IntentOutcome, RetryConfig, RetryOrder, RetryRecord,
    classify,
};
pub use throttle::{Phase, ThrottleConfig, ThrottleState};
pub use tracker::IntentCounts;
pub use writer::{BulkWriter, FlushSummary};
