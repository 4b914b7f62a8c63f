//! Error and Result types for the observation store.

use thiserror::Error;

/// A convenience `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by [`TimeSeriesStore`](crate::TimeSeriesStore) operations.
///
/// An empty result set is never an error; every variant here is a real failure.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying database rejected or failed the operation.
    #[error("{operation} failed ({context}): {source}")]
    Storage {
        /// Store operation that failed.
        operation: &'static str,
        /// Operation parameters, for logging.
        context: String,
        /// Underlying database error.
        #[source]
        source: sqlx::Error,
    },

    /// The store has been closed.
    #[error("{operation} rejected: store is closed")]
    Closed {
        /// Store operation that was attempted.
        operation: &'static str,
    },

    /// A persisted row could not be decoded into an observation.
    #[error("Corrupt observation row {id}: {reason}")]
    Corrupt {
        /// Row id.
        id: i64,
        /// What was wrong with the row.
        reason: String,
    },

    /// The caller passed an argument the store cannot accept.
    #[error("Invalid argument for {operation}: {message}")]
    InvalidArgument {
        /// Store operation that was called.
        operation: &'static str,
        /// Description of the problem.
        message: String,
    },
}

impl StoreError {
    pub(crate) fn storage(
        operation: &'static str,
        context: impl Into<String>,
        source: sqlx::Error,
    ) -> Self {
        StoreError::Storage {
            operation,
            context: context.into(),
            source,
        }
    }

    /// Returns true when the failure was caused by the caller's arguments.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, StoreError::InvalidArgument { .. })
    }

    /// Returns true when the store was closed before the call.
    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed { .. })
    }

    /// Name of the operation that produced this error, if known.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            StoreError::Storage { operation, .. }
            | StoreError::Closed { operation }
            | StoreError::InvalidArgument { operation, .. } => Some(operation),
            StoreError::Corrupt { .. } => None,
        }
    }
}
