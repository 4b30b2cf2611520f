//! Error types for local store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The table has not been defined.
    #[error("table not defined: {0}")]
    TableNotDefined(String),

    /// The table definition is malformed.
    #[error("invalid definition for table {table}: {reason}")]
    InvalidTableDefinition {
        /// Table name.
        table: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A record was written without an `id` field.
    #[error("record in table {0} has no id")]
    MissingId(String),

    /// A record carries an id that is neither a string nor an integer.
    #[error("record in table {table} has an invalid id: {id}")]
    InvalidId {
        /// Table name.
        table: String,
        /// The offending id, rendered as JSON.
        id: String,
    },

    /// The query cannot be evaluated.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The store is held by another process.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// A batch failed and none of its operations were applied.
    #[error("batch failed after {applied} operation(s): {reason}")]
    BatchFailed {
        /// Operations staged before the failure (all discarded).
        applied: usize,
        /// Failure description.
        reason: String,
    },
}
