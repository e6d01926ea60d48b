//! A module for defining a [`Workload`] that generates document writes for a benchmark run.

use std::fmt;
use std::time::Duration;

use bulkwriter_service::{Fields, OpKind, Write};
use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, LogNormal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How documents and their fields are named across rounds.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    /// Every round writes the same documents with the same field names.
    #[default]
    Overlapping,
    /// Every round writes fresh documents with fresh field names.
    Randomized,
}

impl fmt::Display for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadShape::Overlapping => f.write_str("overlapping"),
            PayloadShape::Randomized => f.write_str("randomized"),
        }
    }
}

/// How the writes of a round are submitted to the backend.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Writes are chunked by the caller and committed directly, without retries.
    BatchedCommits,
    /// Writes are enqueued into a bulk writer that batches, throttles and retries.
    #[default]
    BulkWriter,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::BatchedCommits => f.write_str("batched_commits"),
            Strategy::BulkWriter => f.write_str("bulk_writer"),
        }
    }
}

/// A builder for creating a [`Workload`].
#[derive(Debug)]
pub struct WorkloadBuilder {
    name: String,
    seed: u64,
    strategy: Strategy,
    shape: PayloadShape,
    concurrency: usize,
    duration: Option<Duration>,

    documents: usize,
    fields: usize,
    p50_size: u64,
    p99_size: u64,

    set_weight: u8,
    update_weight: u8,
    delete_weight: u8,
}

impl WorkloadBuilder {
    /// Fixes the seed of the random generator, making the generated writes reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// How the writes are submitted.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// How documents and fields are named across rounds.
    pub fn shape(mut self, shape: PayloadShape) -> Self {
        self.shape = shape;
        self
    }

    /// The maximum number of concurrent commits for [`Strategy::BatchedCommits`].
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Runs rounds until `duration` has elapsed instead of a fixed number of loops.
    pub fn duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    /// Number of documents written per round, and number of fields per document.
    pub fn documents(mut self, documents: usize, fields: usize) -> Self {
        self.documents = documents;
        self.fields = fields;
        self
    }

    /// Distribution of field value sizes.
    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.p50_size = p50;
        self.p99_size = p99;
        self
    }

    /// The ratio between sets, updates and deletes.
    pub fn operation_weights(mut self, sets: u8, updates: u8, deletes: u8) -> Self {
        self.set_weight = sets;
        self.update_weight = updates;
        self.delete_weight = deletes;
        self
    }

    /// Creates the workload instance.
    pub fn build(self) -> anyhow::Result<Workload> {
        anyhow::ensure!(self.documents > 0, "workload `{}` has no documents", self.name);
        anyhow::ensure!(self.concurrency > 0, "workload `{}` has no concurrency", self.name);

        let rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_size.max(1) as f64;
        let p99 = self.p99_size.max(self.p50_size).max(1) as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;

        let size_distribution = LogNormal::new(mu, sigma)?;
        let operation_distribution =
            WeightedIndex::new([self.set_weight, self.update_weight, self.delete_weight])?;

        let field_names = (0..self.fields).map(|i| format!("field_{i}")).collect();

        Ok(Workload {
            name: self.name,
            strategy: self.strategy,
            shape: self.shape,
            concurrency: self.concurrency,
            duration: self.duration,
            documents: self.documents,

            rng,
            size_distribution,
            operation_distribution,

            field_names,
            written: Vec::new(),
        })
    }
}

/// Specification of the writes generated for a benchmark run.
#[derive(Debug)]
pub struct Workload {
    /// Name of the workload for identification in logs and reports.
    pub(crate) name: String,
    pub(crate) strategy: Strategy,
    pub(crate) shape: PayloadShape,
    /// The maximum number of concurrent commits for [`Strategy::BatchedCommits`].
    pub(crate) concurrency: usize,
    pub(crate) duration: Option<Duration>,
    documents: usize,

    /// The RNG driving all our distributions.
    rng: SmallRng,
    /// A distribution that generates the sizes of field values.
    size_distribution: LogNormal<f64>,
    /// A distribution that picks set, update or delete.
    operation_distribution: WeightedIndex<u8>,

    /// Field names of overlapping documents, identical in every round.
    field_names: Vec<String>,
    /// Keys written in previous rounds, candidates for updates and deletes.
    written: Vec<String>,
}

impl Workload {
    /// Constructs a new workload builder with the given name.
    pub fn builder(name: impl Into<String>) -> WorkloadBuilder {
        WorkloadBuilder {
            name: name.into(),
            seed: rand::random(),
            strategy: Strategy::default(),
            shape: PayloadShape::default(),
            concurrency: 100,
            duration: None,

            documents: 1000,
            fields: 5,
            p50_size: 64,
            p99_size: 1024,

            set_weight: 100,
            update_weight: 0,
            delete_weight: 0,
        }
    }

    /// Name of the workload.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generates the writes of the next round.
    pub fn next_round(&mut self) -> Vec<Write> {
        let mut writes = Vec::with_capacity(self.documents);
        let mut written = Vec::with_capacity(self.documents);

        for index in 0..self.documents {
            let write = match self.operation_distribution.sample(&mut self.rng) {
                0 => None,
                1 => self
                    .take_written()
                    .map(|key| Write::update(key, self.fields())),
                _ => self.take_written().map(Write::delete),
            };
            let write = write.unwrap_or_else(|| Write::set(self.key(index), self.fields()));

            if write.kind != OpKind::Delete {
                written.push(write.key.clone());
            }
            writes.push(write);
        }

        self.written = written;
        writes
    }

    fn key(&mut self, index: usize) -> String {
        match self.shape {
            PayloadShape::Overlapping => format!("{}-{index:06}", self.name),
            PayloadShape::Randomized => Uuid::from_u128(self.rng.random()).to_string(),
        }
    }

    fn fields(&mut self) -> Fields {
        let mut fields = Fields::new();
        for i in 0..self.field_names.len() {
            let name = match self.shape {
                PayloadShape::Overlapping => self.field_names[i].clone(),
                PayloadShape::Randomized => format!("field_{:08x}", self.rng.next_u32()),
            };
            let value = self.value();
            fields.insert(name, value);
        }
        fields
    }

    fn value(&mut self) -> Value {
        let len = self.size_distribution.sample(&mut self.rng) as usize;
        let value: String = (&mut self.rng)
            .sample_iter(Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        Value::String(value)
    }

    /// Picks a key written in the previous round that has not been picked in this round yet.
    fn take_written(&mut self) -> Option<String> {
        if self.written.is_empty() {
            return None;
        }
        let index = self.rng.random_range(0..self.written.len());
        Some(self.written.swap_remove(index))
    }
}
