//! Error types for the sync protocol.

use crate::operation::OperationAction;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by protocol rules and validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The new action cannot follow the pending one for the same record.
    #[error("unsupported operation sequence: {new} after pending {pending}")]
    UnsupportedCondensation {
        /// Action already pending in the log.
        pending: OperationAction,
        /// Action being logged.
        new: OperationAction,
    },

    /// An action name that is not insert, update or delete.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// A table name that cannot be used.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// A record id that cannot be used.
    #[error("invalid record id: {0}")]
    InvalidRecordId(String),

    /// An incremental pull query id that cannot be used.
    #[error("invalid query id: {0:?}")]
    InvalidQueryId(String),

    /// A log entry was pushed, cancelled or condensed away before it
    /// could be changed.
    #[error("operation {0} is no longer in the log")]
    MissingLogRecord(u64),

    /// A row of the operation table could not be decoded.
    #[error("malformed operation log record: {0}")]
    MalformedLogRecord(String),
}
