//! Condensation rules for the operation log.
//!
//! When a record that already has a pending log entry is mutated again,
//! the new mutation is folded into the pending entry instead of being
//! appended, so the log holds at most one unlocked entry per record.
//!
//! | pending | new    | outcome                        |
//! |---------|--------|--------------------------------|
//! | insert  | update | nop                            |
//! | insert  | delete | remove pending entry           |
//! | update  | update | nop                            |
//! | update  | delete | change pending action → delete |
//! | delete  | delete | nop                            |
//! | *other* |        | unsupported                    |

use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::{OperationAction, OperationLogRecord};
use tablesync_store::{BatchOperation, RecordId};

/// What happens to a pending entry when a new action is logged against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondenseOutcome {
    /// The pending entry already covers the new action.
    Nop,
    /// The two actions cancel out.
    RemovePending,
    /// The pending entry now stands for a different action.
    ChangePendingAction(OperationAction),
}

/// Folds `new` into a pending `pending` action.
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedCondensation`] for sequences that
/// cannot happen to a consistent record (e.g. insert after insert).
pub fn condense(
    pending: OperationAction,
    new: OperationAction,
) -> ProtocolResult<CondenseOutcome> {
    use OperationAction::{Delete, Insert, Update};

    match (pending, new) {
        (Insert, Update) | (Update, Update) | (Delete, Delete) => Ok(CondenseOutcome::Nop),
        (Insert, Delete) => Ok(CondenseOutcome::RemovePending),
        (Update, Delete) => Ok(CondenseOutcome::ChangePendingAction(Delete)),
        (Insert, Insert) | (Update, Insert) | (Delete, Insert) | (Delete, Update) => {
            Err(ProtocolError::UnsupportedCondensation { pending, new })
        }
    }
}

/// The change to the operation table implied by one local mutation.
///
/// Computing it does not touch storage; the caller commits it in the
/// same batch as the data mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggingOperation {
    /// Append a fresh entry.
    Append(OperationLogRecord),
    /// Overwrite an existing entry (same id, new action).
    Rewrite(OperationLogRecord),
    /// Remove an existing entry.
    Remove(OperationLogRecord),
    /// Leave the log unchanged.
    Nop,
}

impl LoggingOperation {
    /// Converts the change into a batch step against `operation_table`.
    pub fn to_batch(&self, operation_table: &str) -> Option<BatchOperation> {
        match self {
            LoggingOperation::Append(entry) | LoggingOperation::Rewrite(entry) => {
                Some(BatchOperation::upsert(operation_table, entry.to_record()))
            }
            LoggingOperation::Remove(entry) => {
                Some(BatchOperation::delete(operation_table, entry.row_id()))
            }
            LoggingOperation::Nop => None,
        }
    }
}

/// Decides how to log `action` on `(table_name, item_id)`.
///
/// `pending` is the newest existing entry for that record, if any, and
/// `locked` the id of the entry currently being pushed. A locked entry is
/// never rewritten or removed; a new entry is appended beside it.
/// `next_id` is only called when an entry is appended.
///
/// # Errors
///
/// Returns an error if the action sequence is unsupported. No id is
/// allocated in that case.
pub fn plan_logging<F>(
    pending: Option<&OperationLogRecord>,
    locked: Option<u64>,
    table_name: &str,
    action: OperationAction,
    item_id: &RecordId,
    next_id: F,
) -> ProtocolResult<LoggingOperation>
where
    F: FnOnce() -> u64,
{
    let append = |next_id: F| {
        LoggingOperation::Append(OperationLogRecord::new(
            next_id(),
            table_name,
            action,
            item_id.clone(),
        ))
    };

    let Some(pending) = pending else {
        return Ok(append(next_id));
    };

    if locked == Some(pending.id) {
        return Ok(append(next_id));
    }

    Ok(match condense(pending.action, action)? {
        CondenseOutcome::Nop => LoggingOperation::Nop,
        CondenseOutcome::RemovePending => LoggingOperation::Remove(pending.clone()),
        CondenseOutcome::ChangePendingAction(changed) => {
            LoggingOperation::Rewrite(pending.with_action(changed))
        }
    })
}
