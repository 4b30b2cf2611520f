//! Draining the operation log to the remote table.

use crate::conflict::PushConflict;
use crate::context::StoreHandle;
use crate::error::{SyncError, SyncResult, TransportError};
use crate::operations::OperationTableManager;
use crate::state::PushState;
use crate::transport::TableTransport;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tablesync_protocol::{
    strip_system_properties, FailureKind, OperationAction, OperationLogRecord,
};
use tablesync_store::{BatchOperation, LocalStore, Record, DELETED_FIELD};
use tracing::{debug, error, info, warn};

/// Callbacks offered a failed push operation before the push moves on.
///
/// A handler settles a failure by calling one of the mutators on the
/// [`PushConflict`]; the operation is then pushed again. Returning
/// without calling one leaves the failure unhandled: a 412 conflict is
/// returned in [`PushResult::conflicts`], any other failure aborts the
/// push. Returning an error aborts the push with that error.
///
/// Implement it for every store type the handler can work with:
///
/// ```rust
/// use tablesync_engine::{PushConflict, PushHandler, SyncResult};
/// use tablesync_store::LocalStore;
///
/// /// Lets the server win every conflict.
/// struct ServerWins;
///
/// impl<S: LocalStore> PushHandler<S> for ServerWins {
///     async fn on_conflict(&self, conflict: &PushConflict<S>) -> SyncResult<()> {
///         match conflict.server_record().cloned() {
///             Some(server) => conflict.update_client_record(server, true).await,
///             None => conflict.cancel_record_push().await,
///         }
///     }
/// }
/// ```
pub trait PushHandler<S: LocalStore>: Send + Sync {
    /// Called for HTTP 412 failures.
    fn on_conflict(
        &self,
        _conflict: &PushConflict<S>,
    ) -> impl Future<Output = SyncResult<()>> + Send {
        async { Ok(()) }
    }

    /// Called for every other failure.
    fn on_error(&self, _conflict: &PushConflict<S>) -> impl Future<Output = SyncResult<()>> + Send {
        async { Ok(()) }
    }
}

/// A handler that leaves every failure unhandled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl<S: LocalStore> PushHandler<S> for NoopHandler {}

/// Outcome of a push.
pub struct PushResult<S> {
    /// Operations accepted by the server.
    pub pushed: usize,
    /// Unresolved conflicts, each skipped for the rest of the push.
    pub conflicts: Vec<PushConflict<S>>,
}

impl<S> PushResult<S> {
    /// Returns true if nothing was left unresolved.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

impl<S> fmt::Debug for PushResult<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushResult")
            .field("pushed", &self.pushed)
            .field("conflicts", &self.conflicts)
            .finish()
    }
}

/// What is sent for one operation.
enum Outgoing {
    Insert(Record),
    Update(Record),
    Delete,
}

impl Outgoing {
    fn client_record(&self) -> Option<&Record> {
        match self {
            Outgoing::Insert(record) | Outgoing::Update(record) => Some(record),
            Outgoing::Delete => None,
        }
    }
}

/// Holds the operation lock; releases it when dropped, whatever the
/// outcome of the attempt.
struct OperationLock<'a, S: LocalStore> {
    operations: &'a OperationTableManager<S>,
    id: u64,
}

impl<'a, S: LocalStore> OperationLock<'a, S> {
    fn acquire(operations: &'a OperationTableManager<S>, id: u64) -> SyncResult<Self> {
        operations.lock_operation(id)?;
        Ok(Self { operations, id })
    }
}

impl<S: LocalStore> Drop for OperationLock<'_, S> {
    fn drop(&mut self) {
        self.operations.unlock_operation();
        debug!(operation_id = self.id, "operation unlocked");
    }
}

/// Pushes the operation log, oldest entry first.
pub(crate) struct PushEngine<'a, S, T> {
    handle: &'a StoreHandle<S>,
    transport: &'a T,
    state: &'a RwLock<PushState>,
}

impl<'a, S: LocalStore, T: TableTransport> PushEngine<'a, S, T> {
    pub(crate) fn new(
        handle: &'a StoreHandle<S>,
        transport: &'a T,
        state: &'a RwLock<PushState>,
    ) -> Self {
        Self {
            handle,
            transport,
            state,
        }
    }

    fn set_state(&self, state: PushState) {
        *self.state.write() = state;
    }

    pub(crate) async fn push<H: PushHandler<S>>(&self, handler: &H) -> SyncResult<PushResult<S>> {
        let result = self.drain(handler).await;
        self.set_state(PushState::Idle);
        result
    }

    async fn drain<H: PushHandler<S>>(&self, handler: &H) -> SyncResult<PushResult<S>> {
        let operations = &*self.handle.operations;
        let max_retries = self.handle.config.max_handler_retries;

        let mut last_processed: Option<u64> = None;
        let mut retries: HashMap<u64, u32> = HashMap::new();
        let mut result = PushResult {
            pushed: 0,
            conflicts: Vec::new(),
        };

        loop {
            self.set_state(PushState::Draining);
            let Some(operation) = operations.read_oldest_after(last_processed)? else {
                break;
            };

            self.set_state(PushState::Locking);
            let lock = OperationLock::acquire(operations, operation.id)?;

            let Some(outgoing) = self.outgoing(&operation)? else {
                warn!(
                    operation_id = operation.id,
                    table = %operation.table_name,
                    item_id = %operation.item_id,
                    "record of pending operation is gone, dropping the operation"
                );
                self.remove_operation(&operation).await?;
                drop(lock);
                continue;
            };
            let client_record = outgoing.client_record().cloned();

            self.set_state(PushState::Pushing);
            debug!(
                operation_id = operation.id,
                table = %operation.table_name,
                item_id = %operation.item_id,
                action = %operation.action,
                "pushing operation"
            );

            match self.send(&operation, outgoing).await {
                Ok(server_record) => {
                    self.set_state(PushState::Applying);
                    self.apply(&operation, server_record).await?;
                    self.set_state(PushState::Unlocking);
                    drop(lock);

                    last_processed = Some(operation.id);
                    result.pushed += 1;
                }
                Err(failure) => {
                    self.set_state(PushState::ConflictHandling);
                    let retry_count = retries.get(&operation.id).copied().unwrap_or(0);
                    let kind = FailureKind::from_status(failure.status);
                    let conflict = PushConflict::new(
                        self.handle.clone(),
                        operation.clone(),
                        client_record,
                        failure,
                        retry_count,
                    );

                    match kind {
                        FailureKind::Conflict => handler.on_conflict(&conflict).await?,
                        FailureKind::Error => handler.on_error(&conflict).await?,
                    }
                    self.set_state(PushState::Unlocking);
                    drop(lock);

                    if conflict.is_handled() {
                        if retry_count < max_retries {
                            retries.insert(operation.id, retry_count + 1);
                            debug!(
                                operation_id = operation.id,
                                retry = retry_count + 1,
                                "push failure handled, pushing again"
                            );
                            continue;
                        }
                        warn!(
                            operation_id = operation.id,
                            max_retries, "handler retry limit reached, failure left unhandled"
                        );
                    }

                    match kind {
                        FailureKind::Conflict => {
                            warn!(
                                operation_id = operation.id,
                                table = %operation.table_name,
                                item_id = %operation.item_id,
                                "unresolved push conflict"
                            );
                            last_processed = Some(operation.id);
                            result.conflicts.push(conflict);
                        }
                        FailureKind::Error => {
                            let source = conflict.error().clone();
                            error!(
                                operation_id = operation.id,
                                table = %operation.table_name,
                                item_id = %operation.item_id,
                                error = %source,
                                "push aborted"
                            );
                            return Err(SyncError::PushAborted {
                                table: operation.table_name,
                                action: operation.action,
                                item_id: operation.item_id,
                                source,
                            });
                        }
                    }
                }
            }
        }

        info!(
            pushed = result.pushed,
            conflicts = result.conflicts.len(),
            "push complete"
        );
        Ok(result)
    }

    /// Joins a log entry with the current local record.
    ///
    /// Returns `None` if an insert or update has no record to send.
    fn outgoing(&self, operation: &OperationLogRecord) -> SyncResult<Option<Outgoing>> {
        if operation.action == OperationAction::Delete {
            return Ok(Some(Outgoing::Delete));
        }
        let Some(record) = self
            .handle
            .store
            .lookup(&operation.table_name, &operation.item_id)?
        else {
            return Ok(None);
        };
        Ok(Some(match operation.action {
            OperationAction::Insert => Outgoing::Insert(strip_system_properties(
                &record,
                &self.handle.config.system_properties,
            )),
            _ => Outgoing::Update(record),
        }))
    }

    async fn send(
        &self,
        operation: &OperationLogRecord,
        outgoing: Outgoing,
    ) -> Result<Option<Record>, TransportError> {
        let table = operation.table_name.as_str();
        match outgoing {
            Outgoing::Insert(record) => self.transport.insert(table, record).await.map(Some),
            Outgoing::Update(record) => self.transport.update(table, record).await.map(Some),
            Outgoing::Delete => self
                .transport
                .delete(table, &operation.item_id)
                .await
                .map(|()| None),
        }
    }

    /// Writes the server's record locally and removes the log entry, in
    /// one batch.
    ///
    /// If a newer local change to the same record is pending, only the
    /// server's stamps (`version`, `updatedAt`, ...) are copied into the
    /// local record, so that change is pushed next against the current
    /// version.
    async fn apply(
        &self,
        operation: &OperationLogRecord,
        server_record: Option<Record>,
    ) -> SyncResult<()> {
        self.handle
            .run(|handle| {
                let mut batch = Vec::with_capacity(2);
                if let Some(record) = server_record {
                    let newer_pending = handle
                        .operations
                        .read_pending_operations(&operation.table_name, &operation.item_id)?
                        .iter()
                        .any(|pending| pending.id > operation.id);
                    if !newer_pending {
                        batch.push(BatchOperation::upsert(&operation.table_name, record));
                    } else if let Some(mut local) = handle
                        .store
                        .lookup(&operation.table_name, &operation.item_id)?
                    {
                        debug!(
                            operation_id = operation.id,
                            "newer local change pending, keeping local record"
                        );
                        copy_server_stamps(&record, &mut local, &handle.config.system_properties);
                        batch.push(BatchOperation::upsert(&operation.table_name, local));
                    }
                }
                batch.push(BatchOperation::delete(
                    handle.operations.table_name(),
                    operation.row_id(),
                ));
                handle.store.execute_batch(&batch)?;
                Ok(())
            })
            .await
    }

    async fn remove_operation(&self, operation: &OperationLogRecord) -> SyncResult<()> {
        self.handle
            .run(|handle| {
                handle.store.execute_batch(&[BatchOperation::delete(
                    handle.operations.table_name(),
                    operation.row_id(),
                )])?;
                Ok(())
            })
            .await
    }
}

/// Copies server-owned properties other than the tombstone flag from
/// `server` into `local`.
fn copy_server_stamps(server: &Record, local: &mut Record, system_properties: &[String]) {
    for property in system_properties {
        if property == DELETED_FIELD {
            continue;
        }
        if let Some(value) = server.get(property) {
            local.insert(property.clone(), value.clone());
        }
    }
}
