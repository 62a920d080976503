//! Error types for dataset operations.

use thiserror::Error;

/// Result type alias for dataset operations.
pub type Result<T> = std::result::Result<T, DatasetError>;

/// Errors that can occur during dataset operations.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The schema descriptor failed validation.
    #[error("invalid schema for {name}: {source}")]
    Schema {
        /// Logical dataset name.
        name: String,
        /// The validation failure.
        #[source]
        source: lake_core::Error,
    },

    /// A produced row could not be accepted.
    #[error("invalid row {index} for {table}: {message}")]
    InvalidRow {
        /// Target table.
        table: String,
        /// Producer index of the offending row.
        index: usize,
        /// What was wrong with it.
        message: String,
    },

    /// A read argument (filter, column) does not match the table.
    #[error("invalid argument for {table}: {message}")]
    InvalidArgument {
        /// Target table.
        table: String,
        /// Description of the problem.
        message: String,
    },

    /// A store operation failed.
    #[error("{operation} on {table} failed: {source}")]
    Store {
        /// Dataset operation that was running.
        operation: &'static str,
        /// Target table.
        table: String,
        /// The underlying store error.
        #[source]
        source: lake_core::Error,
    },
}

impl DatasetError {
    /// Wraps a store error with operation and table context.
    #[must_use]
    pub fn store(operation: &'static str, table: impl Into<String>, source: lake_core::Error) -> Self {
        Self::Store {
            operation,
            table: table.into(),
            source,
        }
    }

    /// Creates an invalid-row error.
    #[must_use]
    pub fn invalid_row(table: impl Into<String>, index: usize, message: impl Into<String>) -> Self {
        Self::InvalidRow {
            table: table.into(),
            index,
            message: message.into(),
        }
    }

    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            table: table.into(),
            message: message.into(),
        }
    }
}
