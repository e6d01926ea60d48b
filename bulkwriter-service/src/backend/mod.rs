//! The collaborator boundary to the document store.

mod common;
mod in_memory;

pub use common::*;
pub use in_memory::{FaultHook, InMemoryBackend, Simulation};
