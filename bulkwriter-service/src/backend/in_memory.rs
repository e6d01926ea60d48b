//! In-memory document store simulating a remote, rate-limited backend.
//!
//! This provides a [`Backend`](super::Backend) backed by a `HashMap`. Besides plain document
//! semantics it can simulate commit latency, a quota on concurrent commits, and write contention
//! on documents touched by overlapping commits. The backend is [`Clone`] so callers can hold a
//! handle for inspection while a writer owns another.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::common::{Backend, CommitResult, OpResult};
use crate::error::{CommitError, ErrorKind, OpError};
use crate::intent::{Fields, OpKind, Write, WriteIntent};

/// Injects a per-operation error.
///
/// Called with the global sequence number of the operation (starting at `0`) and the write. A
/// returned error replaces the outcome of that operation.
pub type FaultHook = Arc<dyn Fn(u64, &Write) -> Option<OpError> + Send + Sync>;

/// Behavior of the simulated backend.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Simulation {
    /// Time every commit takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Quota of concurrent commits. Commits beyond it are rejected with `RESOURCE_EXHAUSTED`.
    pub max_concurrent_commits: Option<usize>,
    /// Whether a document written by one commit is locked for all overlapping commits.
    ///
    /// Writes to a locked document fail with `ABORTED`.
    pub contention: bool,
}

/// A simulated document store.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

struct Inner {
    simulation: Simulation,
    documents: Mutex<HashMap<String, Fields>>,
    locked: Mutex<HashSet<String>>,
    fault: Mutex<Option<FaultHook>>,
    unreachable: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    commits: AtomicU64,
    operations: AtomicU64,
}

impl fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("simulation", &self.inner.simulation)
            .field("commits", &self.commits())
            .finish_non_exhaustive()
    }
}

impl InMemoryBackend {
    /// Creates an empty store with the given simulation settings.
    pub fn new(simulation: Simulation) -> Self {
        Self {
            inner: Arc::new(Inner {
                simulation,
                documents: Mutex::new(HashMap::new()),
                locked: Mutex::new(HashSet::new()),
                fault: Mutex::new(None),
                unreachable: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                commits: AtomicU64::new(0),
                operations: AtomicU64::new(0),
            }),
        }
    }

    /// Installs a fault hook, replacing any previous one.
    pub fn with_fault(self, hook: FaultHook) -> Self {
        self.set_fault(Some(hook));
        self
    }

    /// Installs or removes the fault hook.
    pub fn set_fault(&self, hook: Option<FaultHook>) {
        *self.inner.fault.lock().unwrap() = hook;
    }

    /// Makes every following commit fail as if the backend could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Returns a copy of the document stored at `key`.
    pub fn get(&self, key: &str) -> Option<Fields> {
        self.inner.documents.lock().unwrap().get(key).cloned()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.inner.documents.lock().unwrap().len()
    }

    /// Returns `true` if no document is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of commit calls received, including rejected ones.
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    /// Number of operations that reached the store, successful or not.
    pub fn operations(&self) -> u64 {
        self.inner.operations.load(Ordering::Relaxed)
    }

    /// Highest number of commits that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn commit(&self, intents: &[WriteIntent]) -> CommitResult {
        let inner = &*self.inner;
        inner.commits.fetch_add(1, Ordering::Relaxed);

        if inner.unreachable.load(Ordering::Relaxed) {
            return Err(CommitError::Unreachable {
                context: "in-memory backend is offline".into(),
                cause: std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into(),
            });
        }

        let in_flight = InFlight::enter(inner);
        if let Some(max) = inner.simulation.max_concurrent_commits
            && in_flight.count > max
        {
            return Err(CommitError::Rejected(OpError::new(
                ErrorKind::ResourceExhausted,
                format!("{} concurrent commits exceed the quota of {max}", in_flight.count),
            )));
        }

        let mut claims = KeyClaims::new(&inner.locked);
        let claimed: Vec<bool> = intents
            .iter()
            .map(|intent| !inner.simulation.contention || claims.claim(&intent.write().key))
            .collect();

        if !inner.simulation.latency.is_zero() {
            tokio::time::sleep(inner.simulation.latency).await;
        }

        let fault = inner.fault.lock().unwrap().clone();
        let mut documents = inner.documents.lock().unwrap();
        let results = intents
            .iter()
            .zip(claimed)
            .map(|(intent, claimed)| {
                let write = intent.write();
                let seq = inner.operations.fetch_add(1, Ordering::Relaxed);
                if !claimed {
                    return Err(OpError::new(
                        ErrorKind::Aborted,
                        format!("document `{}` is locked by a concurrent commit", write.key),
                    ));
                }
                if let Some(error) = fault.as_ref().and_then(|hook| hook(seq, write)) {
                    return Err(error);
                }
                apply(&mut documents, write)
            })
            .collect();

        Ok(results)
    }
}

fn apply(documents: &mut HashMap<String, Fields>, write: &Write) -> OpResult {
    if write.key.is_empty() {
        return Err(OpError::new(ErrorKind::InvalidArgument, "document key is empty"));
    }

    match write.kind {
        OpKind::Set => {
            documents.insert(write.key.clone(), write.fields.clone());
            Ok(())
        }
        OpKind::Update => match documents.get_mut(&write.key) {
            Some(document) => {
                document.extend(write.fields.clone());
                Ok(())
            }
            None => Err(not_found(&write.key)),
        },
        OpKind::Delete => match documents.remove(&write.key) {
            Some(_) => Ok(()),
            None => Err(not_found(&write.key)),
        },
    }
}

fn not_found(key: &str) -> OpError {
    OpError::new(ErrorKind::NotFound, format!("no document at `{key}`"))
}

/// Counts a commit as in flight until dropped.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    count: usize,
}

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let count = inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        inner.peak_in_flight.fetch_max(count, Ordering::Relaxed);
        Self {
            counter: &inner.in_flight,
            count,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Document locks held by one commit, released when dropped.
struct KeyClaims<'a> {
    locked: &'a Mutex<HashSet<String>>,
    keys: Vec<String>,
}

impl<'a> KeyClaims<'a> {
    fn new(locked: &'a Mutex<HashSet<String>>) -> Self {
        Self {
            locked,
            keys: Vec::new(),
        }
    }

    fn claim(&mut self, key: &str) -> bool {
        let claimed = self.locked.lock().unwrap().insert(key.to_owned());
        if claimed {
            self.keys.push(key.to_owned());
        }
        claimed
    }
}

impl Drop for KeyClaims<'_> {
    fn drop(&mut self) {
        let mut locked = self.locked.lock().unwrap();
        for key in &self.keys {
            locked.remove(key);
        }
    }
}
