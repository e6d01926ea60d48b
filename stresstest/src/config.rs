//! Configuration for the stresstest binary.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//!
//! 1. Environment variables (prefixed with `BENCH__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! Environment variables use double underscores (`__`) to denote nested structures, for example
//! `BENCH__LOOPS=3` or `BENCH__WRITER__THROTTLE__CEILING=50`.
//!
//! ```yaml
//! backend:
//!   type: memory
//!   simulation:
//!     latency: 5ms
//!     max_concurrent_commits: 20
//!
//! loops: 10
//! batch_sizes: [20, 100, 500]
//!
//! workloads:
//!   - name: overlapping
//!     strategy: bulk_writer
//!     shape: overlapping
//!     documents: 1000
//!     fields: 5
//!     value_sizes:
//!       p50: 64B
//!       p99: 1KiB
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bulkwriter_service::{Backend, InMemoryBackend, Simulation, WriterConfig};
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::http::HttpBackend;
use crate::workload::{PayloadShape, Strategy, Workload};

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "BENCH__";

/// The backend that writes are committed against.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// The simulated in-process document store (type `"memory"`).
    Memory {
        /// Latency, quota and contention of the simulated store.
        #[serde(default)]
        simulation: Simulation,
    },
    /// A remote document store reached over HTTP (type `"http"`).
    Http {
        /// Base URL of the store, e.g. `http://localhost:8888`.
        remote: String,
        /// Timeout of a single commit request.
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Memory {
            simulation: Simulation::default(),
        }
    }
}

impl BackendConfig {
    /// Creates the configured backend.
    pub fn build(&self) -> Result<Arc<dyn Backend>> {
        Ok(match self {
            BackendConfig::Memory { simulation } => {
                Arc::new(InMemoryBackend::new(simulation.clone()))
            }
            BackendConfig::Http { remote, timeout } => {
                Arc::new(HttpBackend::new(remote.clone(), *timeout)?)
            }
        })
    }
}

/// Percentiles of the log-normal distribution of field value sizes.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct ValueSizes {
    /// Median value size.
    pub p50: ByteSize,
    /// 99th percentile value size.
    pub p99: ByteSize,
}

/// Relative weights of the write kinds generated per document.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Operations {
    /// Weight of replacing writes.
    pub sets: u8,
    /// Weight of merging writes to documents of the previous round.
    pub updates: u8,
    /// Weight of deletes of documents of the previous round.
    pub deletes: u8,
}

impl Default for Operations {
    fn default() -> Self {
        Self {
            sets: 100,
            updates: 0,
            deletes: 0,
        }
    }
}

/// A single benchmark workload.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Name shown in the report.
    pub name: String,
    /// How writes are submitted.
    pub strategy: Strategy,
    /// How documents and fields are named across loops.
    pub shape: PayloadShape,
    /// Documents written per loop.
    pub documents: usize,
    /// Fields per document.
    pub fields: usize,
    /// Distribution of field value sizes.
    pub value_sizes: ValueSizes,
    /// Relative weights of sets, updates and deletes.
    pub operations: Operations,
    /// Concurrent commits of the `batched_commits` strategy.
    pub concurrency: usize,
    /// Runs loops until this much time has passed, instead of a fixed number of loops.
    #[serde(with = "humantime_serde")]
    pub duration: Option<Duration>,
    /// Fixed seed for reproducible payloads.
    pub seed: Option<u64>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            strategy: Strategy::default(),
            shape: PayloadShape::default(),
            documents: 1000,
            fields: 5,
            value_sizes: ValueSizes {
                p50: ByteSize::b(64),
                p99: ByteSize::kib(1),
            },
            operations: Operations::default(),
            concurrency: 100,
            duration: None,
            seed: None,
        }
    }
}

impl WorkloadConfig {
    /// Creates the workload described by this configuration.
    pub fn build(&self) -> Result<Workload> {
        let mut builder = Workload::builder(self.name.clone())
            .strategy(self.strategy)
            .shape(self.shape)
            .concurrency(self.concurrency)
            .duration(self.duration)
            .documents(self.documents, self.fields)
            .size_distribution(self.value_sizes.p50.as_u64(), self.value_sizes.p99.as_u64())
            .operation_weights(
                self.operations.sets,
                self.operations.updates,
                self.operations.deletes,
            );
        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        builder.build()
    }
}

/// Configuration of a benchmark run.
#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// The backend to commit against.
    pub backend: BackendConfig,
    /// Loops per workload and batch size, unless the workload is timed.
    pub loops: usize,
    /// The batch sizes to compare. Every workload runs once per batch size.
    pub batch_sizes: Vec<usize>,
    /// Settings of the bulk writer. The batch size is overridden per run.
    pub writer: WriterConfig,
    /// The workloads to run, in order.
    pub workloads: Vec<WorkloadConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            loops: 10,
            batch_sizes: vec![20, 100, 250, 500],
            writer: WriterConfig::default(),
            workloads: vec![
                WorkloadConfig {
                    name: "overlapping".into(),
                    shape: PayloadShape::Overlapping,
                    ..Default::default()
                },
                WorkloadConfig {
                    name: "randomized".into(),
                    shape: PayloadShape::Randomized,
                    ..Default::default()
                },
            ],
        }
    }
}

impl Config {
    /// Loads configuration from an optional YAML file and the environment.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if `path` is given)
    /// 3. Environment variables (prefixed with `BENCH__`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, if a value has the wrong type, or if
    /// the resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values that would make the run meaningless.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.loops > 0, "`loops` must be at least 1");
        anyhow::ensure!(!self.batch_sizes.is_empty(), "`batch_sizes` must not be empty");
        anyhow::ensure!(
            self.batch_sizes.iter().all(|&size| size > 0),
            "`batch_sizes` must not contain 0"
        );
        anyhow::ensure!(!self.workloads.is_empty(), "no workloads configured");
        self.writer.validate()?;
        Ok(())
    }
}
