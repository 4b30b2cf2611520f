//! # tablesync Protocol
//!
//! Sync vocabulary shared by the tablesync engine and its stores.
//!
//! This crate provides:
//! - [`OperationAction`] and [`OperationLogRecord`] for the operation log
//! - [`condense`] and [`plan_logging`] for log condensation
//! - [`FailureKind`] and [`ConflictResolution`] for push failures
//! - Validation of table names, record ids and query ids
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Example
//!
//! ```rust
//! use tablesync_protocol::{condense, CondenseOutcome, OperationAction};
//!
//! let outcome = condense(OperationAction::Insert, OperationAction::Delete).unwrap();
//! assert_eq!(outcome, CondenseOutcome::RemovePending);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod operation;
mod oplog;
mod validation;

pub use conflict::{ConflictResolution, FailureKind, HTTP_PRECONDITION_FAILED};
pub use error::{ProtocolError, ProtocolResult};
pub use operation::{
    operation_table_definition, OperationAction, OperationLogRecord, ACTION_FIELD, ITEM_ID_FIELD,
    TABLE_NAME_FIELD,
};
pub use oplog::{condense, plan_logging, CondenseOutcome, LoggingOperation};
pub use validation::{
    is_system_table, record_id, strip_system_properties, validate_query_id, validate_record_id,
    validate_table_name, CREATED_AT, SYSTEM_PROPERTIES, SYSTEM_TABLE_PREFIX, UPDATED_AT, VERSION,
};
