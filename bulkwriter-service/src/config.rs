//! Configuration of a [`BulkWriter`](crate::BulkWriter).
//!
//! All tunables live in one immutable [`WriterConfig`] that is validated once when the writer is
//! created. Invalid values are rejected, never clamped. The structs deserialize from YAML or any
//! other serde format, with durations in human readable form:
//!
//! ```yaml
//! max_batch_size: 500
//! max_in_flight_bytes: 10 MiB
//! linger: 10ms
//! throttle:
//!   enabled: true
//!   initial: 10
//!   ceiling: 200
//!   decay: 0.7
//!   cooldown: 1s
//! retry:
//!   base: 50ms
//!   cap: 5s
//!   max_attempts: 10
//! report_window: 1s
//! ```

use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryConfig;
use crate::throttle::ThrottleConfig;

/// Tunables of a [`BulkWriter`](crate::BulkWriter).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum number of intents per batch.
    ///
    /// Can be changed at runtime with
    /// [`BulkWriter::set_max_batch_size`](crate::BulkWriter::set_max_batch_size).
    pub max_batch_size: usize,

    /// Maximum estimated payload size of all batches being committed at the same time.
    ///
    /// Batches are formed only while the bytes already in flight leave room. A single intent
    /// larger than this is still sent, in a batch of its own, once nothing else is in flight.
    pub max_in_flight_bytes: ByteSize,

    /// How long a partial batch may wait for more intents before it is sent anyway.
    #[serde(with = "humantime_serde")]
    pub linger: Duration,

    /// Cap on concurrent commits when adaptive throttling is disabled.
    pub static_concurrency: usize,

    /// Adaptive throttling.
    pub throttle: ThrottleConfig,

    /// Retry policy.
    pub retry: RetryConfig,

    /// Size of the windows throughput is aggregated into.
    #[serde(with = "humantime_serde")]
    pub report_window: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            max_in_flight_bytes: ByteSize::mib(10),
            linger: Duration::from_millis(10),
            static_concurrency: 100,
            throttle: ThrottleConfig::default(),
            retry: RetryConfig::default(),
            report_window: Duration::from_secs(1),
        }
    }
}

impl WriterConfig {
    /// Checks all values, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::new("max_batch_size", "must be at least 1"));
        }
        if self.max_in_flight_bytes.as_u64() == 0 {
            return Err(ConfigError::new("max_in_flight_bytes", "must be at least 1 byte"));
        }
        if self.static_concurrency == 0 {
            return Err(ConfigError::new("static_concurrency", "must be at least 1"));
        }
        if self.report_window.is_zero() {
            return Err(ConfigError::new("report_window", "must be greater than zero"));
        }
        self.throttle.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}
