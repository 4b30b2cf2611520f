//! Error types for the sync engine.

use tablesync_protocol::{OperationAction, ProtocolError, HTTP_PRECONDITION_FAILED};
use tablesync_store::{Record, RecordId, StoreError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// A failed request against the remote table service.
///
/// Shaped after an HTTP response: `status` is absent for failures that
/// never produced a response (connection refused, timeouts).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{}", describe(.status, .message))]
pub struct TransportError {
    /// HTTP status, if a response was received.
    pub status: Option<u16>,
    /// Human readable description.
    pub message: String,
    /// The server's current version of the record, sent with conflicts.
    pub server_record: Option<Record>,
}

fn describe(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("remote request failed with status {status}: {message}"),
        None => format!("remote request failed: {message}"),
    }
}

impl TransportError {
    /// Creates a 412 carrying the server's version of the record.
    pub fn precondition_failed(server_record: Option<Record>) -> Self {
        Self {
            status: Some(HTTP_PRECONDITION_FAILED),
            message: "precondition failed".into(),
            server_record,
        }
    }

    /// Creates an error for a non-success HTTP status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            server_record: None,
        }
    }

    /// Creates an error for a request that got no response.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            server_record: None,
        }
    }

    /// Returns true if the server rejected a stale version (HTTP 412).
    pub fn is_conflict(&self) -> bool {
        self.status == Some(HTTP_PRECONDITION_FAILED)
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Table name is blank, malformed or reserved.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// Record id is missing or malformed.
    #[error("invalid record id: {0}")]
    InvalidRecordId(String),

    /// Record does not have the expected shape.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Query uses clauses the engine does not accept.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Incremental pull query id is malformed.
    #[error("invalid query id: {0:?}")]
    InvalidQueryId(String),

    /// Insert of a record whose id is already present locally.
    #[error("record {id} already exists in table {table}")]
    RecordAlreadyExists {
        /// Table name.
        table: String,
        /// Record id.
        id: RecordId,
    },

    /// Update or delete of a record that is not present locally.
    #[error("record {id} not found in table {table}")]
    RecordNotFound {
        /// Table name.
        table: String,
        /// Record id.
        id: RecordId,
    },

    /// The context was used before `initialize()`.
    #[error("sync context is not initialized")]
    NotInitialized,

    /// The operation log rejected a mutation or holds an unreadable row.
    #[error("operation log error: {0}")]
    Condensation(ProtocolError),

    /// A different operation is already locked for push.
    #[error("operation {locked} is locked, cannot lock {requested}")]
    OperationLocked {
        /// Currently locked operation id.
        locked: u64,
        /// Operation id that was requested.
        requested: u64,
    },

    /// Local store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A push was aborted by an unhandled failure.
    #[error("push aborted at {action} of {item_id} in table {table}: {source}")]
    PushAborted {
        /// Table of the failing operation.
        table: String,
        /// Action of the failing operation.
        action: OperationAction,
        /// Record id of the failing operation.
        item_id: RecordId,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// A pull failed while reading from the remote table.
    #[error("pull of table {table} failed: {source}")]
    Pull {
        /// Pulled table.
        table: String,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// A push handler failed.
    #[error("push handler failed: {0}")]
    Handler(String),

    /// A conflict mutator was given a record for a different id.
    #[error("record id {actual} does not match conflicting operation on {expected}")]
    ConflictMismatch {
        /// Id of the conflicting operation.
        expected: RecordId,
        /// Id carried by the supplied record.
        actual: String,
    },
}

impl SyncError {
    /// Returns true for errors caused by invalid caller input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidTableName(_)
                | SyncError::InvalidRecordId(_)
                | SyncError::InvalidRecord(_)
                | SyncError::InvalidQuery(_)
                | SyncError::InvalidQueryId(_)
                | SyncError::ConflictMismatch { .. }
        )
    }

    /// Returns true for insert-on-existing and update/delete-on-missing.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::RecordAlreadyExists { .. } | SyncError::RecordNotFound { .. }
        )
    }

    /// Returns the remote failure behind this error, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            SyncError::PushAborted { source, .. } | SyncError::Pull { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::InvalidTableName(name) => SyncError::InvalidTableName(name),
            ProtocolError::InvalidRecordId(reason) => SyncError::InvalidRecordId(reason),
            ProtocolError::InvalidQueryId(id) => SyncError::InvalidQueryId(id),
            other => SyncError::Condensation(other),
        }
    }
}
