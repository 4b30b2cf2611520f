//! Failed push operations offered to push handlers.

use crate::context::StoreHandle;
use crate::error::{SyncError, SyncResult, TransportError};
use parking_lot::Mutex;
use std::fmt;
use tablesync_protocol::{
    record_id, ConflictResolution, OperationAction, OperationLogRecord, ProtocolError,
};
use tablesync_store::{BatchOperation, LocalStore, Record, RecordId};
use tracing::debug;

/// A push failure for one operation.
///
/// Wraps the log entry, the record that was sent and the server's
/// answer. The mutators let a handler settle the failure before the push
/// continues; each one is a single atomic batch against the local store
/// and marks the failure handled. A handled failure is pushed again, an
/// unhandled 412 is returned in [`crate::PushResult::conflicts`].
///
/// Conflicts returned from a push stay usable: resolving them afterwards
/// prepares the next push.
pub struct PushConflict<S> {
    handle: StoreHandle<S>,
    operation: OperationLogRecord,
    client_record: Option<Record>,
    error: TransportError,
    retry_count: u32,
    resolution: Mutex<Option<ConflictResolution>>,
}

impl<S: LocalStore> PushConflict<S> {
    pub(crate) fn new(
        handle: StoreHandle<S>,
        operation: OperationLogRecord,
        client_record: Option<Record>,
        error: TransportError,
        retry_count: u32,
    ) -> Self {
        Self {
            handle,
            operation,
            client_record,
            error,
            retry_count,
            resolution: Mutex::new(None),
        }
    }

    /// Table of the failed operation.
    pub fn table_name(&self) -> &str {
        &self.operation.table_name
    }

    /// Action of the failed operation.
    pub fn action(&self) -> OperationAction {
        self.operation.action
    }

    /// Id of the failed log entry.
    pub fn operation_id(&self) -> u64 {
        self.operation.id
    }

    /// Id of the affected record.
    pub fn item_id(&self) -> &RecordId {
        &self.operation.item_id
    }

    /// The server's version of the record, if it sent one.
    pub fn server_record(&self) -> Option<&Record> {
        self.error.server_record.as_ref()
    }

    /// The record that was sent. `None` for deletes.
    pub fn client_record(&self) -> Option<&Record> {
        self.client_record.as_ref()
    }

    /// The underlying failure.
    pub fn error(&self) -> &TransportError {
        &self.error
    }

    /// Returns true if the server rejected a stale version (HTTP 412).
    pub fn is_conflict(&self) -> bool {
        self.error.is_conflict()
    }

    /// Returns true once a mutator ran.
    pub fn is_handled(&self) -> bool {
        self.resolution.lock().is_some()
    }

    /// How the failure was settled, if it was.
    pub fn resolution(&self) -> Option<ConflictResolution> {
        self.resolution.lock().clone()
    }

    /// How often this operation was already re-pushed during the
    /// current push.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Replaces the local record with `record`.
    ///
    /// With `cancel_push` the log entry is removed as well, so this
    /// change is never pushed.
    ///
    /// # Errors
    ///
    /// Fails if `record` has a different id than the operation, or on
    /// storage errors.
    pub async fn update_client_record(&self, record: Record, cancel_push: bool) -> SyncResult<()> {
        self.ensure_same_id(&record)?;

        let mut batch = vec![BatchOperation::upsert(self.table_name(), record)];
        if cancel_push {
            batch.push(self.remove_log_entry());
        }
        self.commit(batch).await?;

        self.resolve(if cancel_push {
            ConflictResolution::CancelledPush
        } else {
            ConflictResolution::UpdatedClientRecord
        });
        Ok(())
    }

    /// Deletes the local record.
    ///
    /// With `cancel_push` the log entry is removed. Otherwise it becomes
    /// a delete, so the next attempt removes the record remotely too.
    ///
    /// # Errors
    ///
    /// Without `cancel_push`, fails with [`SyncError::Condensation`] if
    /// the log entry is gone. Fails on storage errors.
    pub async fn delete_client_record(&self, cancel_push: bool) -> SyncResult<()> {
        let mut batch = vec![BatchOperation::delete(
            self.table_name(),
            self.item_id().clone(),
        )];
        if cancel_push {
            batch.push(self.remove_log_entry());
            self.commit(batch).await?;
        } else {
            batch.push(self.rewrite_log_entry(OperationAction::Delete));
            self.commit_to_entry(batch).await?;
        }

        self.resolve(if cancel_push {
            ConflictResolution::CancelledPush
        } else {
            ConflictResolution::DeletedClientRecord
        });
        Ok(())
    }

    /// Changes the logged action, and optionally the local record, so the
    /// next attempt sends something the server accepts (e.g. turning a
    /// rejected insert into an update).
    ///
    /// # Errors
    ///
    /// Fails if `record` has a different id than the operation, with
    /// [`SyncError::Condensation`] if the log entry is gone, or on
    /// storage errors.
    pub async fn change_action(
        &self,
        action: OperationAction,
        record: Option<Record>,
    ) -> SyncResult<()> {
        let mut batch = Vec::with_capacity(2);
        if let Some(record) = record {
            self.ensure_same_id(&record)?;
            batch.push(BatchOperation::upsert(self.table_name(), record));
        }
        batch.push(self.rewrite_log_entry(action));
        self.commit_to_entry(batch).await?;

        self.resolve(ConflictResolution::ChangedAction(action));
        Ok(())
    }

    /// Drops the log entry and keeps the local record as it is. Later
    /// changes to the record are logged normally.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub async fn cancel_record_push(&self) -> SyncResult<()> {
        self.commit(vec![self.remove_log_entry()]).await?;
        self.resolve(ConflictResolution::CancelledPush);
        Ok(())
    }

    fn ensure_same_id(&self, record: &Record) -> SyncResult<()> {
        let id = record_id(record)?;
        if id != self.operation.item_id {
            return Err(SyncError::ConflictMismatch {
                expected: self.operation.item_id.clone(),
                actual: id.to_string(),
            });
        }
        Ok(())
    }

    fn remove_log_entry(&self) -> BatchOperation {
        BatchOperation::delete(
            self.handle.operations.table_name(),
            self.operation.row_id(),
        )
    }

    fn rewrite_log_entry(&self, action: OperationAction) -> BatchOperation {
        BatchOperation::upsert(
            self.handle.operations.table_name(),
            self.operation.with_action(action).to_record(),
        )
    }

    async fn commit(&self, batch: Vec<BatchOperation>) -> SyncResult<()> {
        self.handle
            .run(move |handle| Ok(handle.store.execute_batch(&batch)?))
            .await
    }

    /// Commits `batch` only while the log entry still exists, so a
    /// rewrite never brings back an entry that was pushed or removed.
    async fn commit_to_entry(&self, batch: Vec<BatchOperation>) -> SyncResult<()> {
        let id = self.operation.id;
        self.handle
            .run(move |handle| {
                if handle.operations.read_operation(id)?.is_none() {
                    return Err(ProtocolError::MissingLogRecord(id).into());
                }
                Ok(handle.store.execute_batch(&batch)?)
            })
            .await
    }

    fn resolve(&self, resolution: ConflictResolution) {
        debug!(
            operation_id = self.operation.id,
            table = %self.operation.table_name,
            item_id = %self.operation.item_id,
            %resolution,
            "push failure resolved"
        );
        *self.resolution.lock() = Some(resolution);
    }
}

impl<S> fmt::Debug for PushConflict<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushConflict")
            .field("operation", &self.operation)
            .field("client_record", &self.client_record)
            .field("error", &self.error)
            .field("retry_count", &self.retry_count)
            .field("resolution", &*self.resolution.lock())
            .finish()
    }
}
