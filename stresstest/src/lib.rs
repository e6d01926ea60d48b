//! A benchmark harness for the bulk writer.
//!
//! The harness runs [`Workload`]s against a backend, once per configured batch size, and prints
//! the throughput of every run. A workload is either committed through a
//! [`BulkWriter`](bulkwriter_service::BulkWriter), or chunked and committed directly without any
//! retries, to compare both strategies.
//!
//! Field value sizes follow a *LogNormal* distribution defined by the `p50` and `p99` of sizes.
//! Documents either reuse the same keys and field names in every loop (*overlapping*), or use
//! fresh random ones (*randomized*).
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod http;
pub mod observability;
pub mod stresstest;
pub mod workload;

pub use crate::config::Config;
pub use crate::stresstest::{BatchReport, RunOptions, run};
pub use crate::workload::Workload;
