//! Error taxonomy of the bulk writer.
//!
//! Backend failures come in two granularities: [`OpError`] for a single operation inside a
//! commit, and [`CommitError`] for a commit that failed as a whole. Configuration problems are
//! reported through [`ConfigError`] before anything is dispatched.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classifiable error codes reported by the backend store.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The operation conflicted with a concurrent transaction and was aborted.
    Aborted,
    /// A quota or rate limit of the backend was exceeded.
    ResourceExhausted,
    /// The backend is transiently unavailable.
    Unavailable,
    /// The operation was malformed.
    InvalidArgument,
    /// The caller is not allowed to perform the operation.
    PermissionDenied,
    /// The target document of an update or delete does not exist.
    NotFound,
}

impl ErrorKind {
    /// Returns the canonical upper-case code of this kind, e.g. `RESOURCE_EXHAUSTED`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Aborted => "ABORTED",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::NotFound => "NOT_FOUND",
        }
    }

    /// Returns `true` if this kind signals that the backend is overloaded.
    ///
    /// These are the signals that make the rate controller back off.
    pub fn is_congestion(self) -> bool {
        matches!(self, ErrorKind::Aborted | ErrorKind::ResourceExhausted)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single operation within a commit.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct OpError {
    /// The classifiable error code.
    pub kind: ErrorKind,
    /// Human readable detail from the backend.
    pub message: String,
}

impl OpError {
    /// Creates a new operation error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failure of an entire commit call.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The backend rejected the whole batch with a classifiable error.
    ///
    /// Every operation of the batch is treated as failed with this error.
    #[error("batch rejected: {0}")]
    Rejected(OpError),

    /// The backend could not be reached at all. This aborts the run.
    #[error("backend unreachable: {context}")]
    Unreachable {
        /// What the backend was doing when the connection failed.
        context: String,
        /// The underlying transport error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Invalid writer configuration, detected at construction time.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid configuration for `{field}`: {reason}")]
pub struct ConfigError {
    /// Dotted path of the offending field, e.g. `throttle.decay`.
    pub field: &'static str,
    /// Why the value was rejected.
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that abort the operation of a [`BulkWriter`](crate::BulkWriter).
#[derive(Debug, Error)]
pub enum Error {
    /// The writer configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The backend could not be reached and the run was aborted.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The writer is shutting down and no longer accepts writes.
    #[error("bulk writer is shutting down")]
    ShuttingDown,
}

/// A convenience alias that defaults our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
