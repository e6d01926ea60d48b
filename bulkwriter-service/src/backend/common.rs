use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{CommitError, OpError};
use crate::intent::WriteIntent;

/// Result of a single operation within a commit.
pub type OpResult = Result<(), OpError>;

/// Result of a commit call: one [`OpResult`] per submitted intent, in submission order.
pub type CommitResult = Result<Vec<OpResult>, CommitError>;

/// A type-erased [`Backend`] instance.
pub type BoxedBackend = Box<dyn Backend>;

/// A document store that can commit batches of writes.
#[async_trait::async_trait]
pub trait Backend: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Commits the writes of the given intents.
    ///
    /// On success, returns exactly one result per intent, in the same order. Returning an error
    /// fails the whole batch.
    async fn commit(&self, intents: &[WriteIntent]) -> CommitResult;
}

#[async_trait::async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn commit(&self, intents: &[WriteIntent]) -> CommitResult {
        (**self).commit(intents).await
    }
}
