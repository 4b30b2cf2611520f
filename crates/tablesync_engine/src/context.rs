//! The sync context: local CRUD with logging, push and pull.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::operations::OperationTableManager;
use crate::pull::{checkpoint_table_definition, PullEngine, PullResult};
use crate::push::{NoopHandler, PushEngine, PushHandler, PushResult};
use crate::runner::TaskRunner;
use crate::state::{PushState, SyncStats};
use crate::transport::TableTransport;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tablesync_protocol::{
    is_system_table, validate_record_id, validate_table_name, OperationAction,
};
use tablesync_store::{
    BatchOperation, LocalStore, Query, ReadResult, Record, RecordId, TableDefinition, ID_FIELD,
};
use tracing::{debug, info};

/// Everything that touches the local store, shared by the context, the
/// engines and the conflicts they hand out.
pub(crate) struct StoreHandle<S> {
    pub(crate) store: Arc<S>,
    pub(crate) runner: TaskRunner,
    pub(crate) operations: Arc<OperationTableManager<S>>,
    pub(crate) config: Arc<SyncConfig>,
}

impl<S> Clone for StoreHandle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            runner: self.runner.clone(),
            operations: Arc::clone(&self.operations),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: LocalStore> StoreHandle<S> {
    /// Runs `task` on the store runner, after every previously submitted
    /// store task.
    pub(crate) async fn run<T, F>(&self, task: F) -> SyncResult<T>
    where
        F: FnOnce(&Self) -> SyncResult<T>,
    {
        self.runner.run(|| async move { task(self) }).await
    }
}

/// Offline-capable access to synced tables.
///
/// Local inserts, updates and deletes are written together with their
/// operation log entry in one atomic batch. `push` sends the log to the
/// remote table, `pull` merges remote changes into the local store.
///
/// # Thread Safety
///
/// Three independent [`TaskRunner`]s serialize work: one for every
/// mutation of the local store, one for pushes and one for pulls. A push
/// and a pull may run at the same time as each other and as local CRUD;
/// two pushes (or two pulls) never overlap.
///
/// # Example
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), tablesync_engine::SyncError> {
/// use tablesync_engine::{MockTransport, SyncConfig, SyncContext};
/// use tablesync_store::{ColumnType, MemoryStore, TableDefinition};
/// use serde_json::json;
///
/// let context = SyncContext::new(MemoryStore::new(), MockTransport::new(), SyncConfig::new());
/// context.initialize().await?;
/// context
///     .define_table(&TableDefinition::new("todo").column("id", ColumnType::String))
///     .await?;
///
/// let record = json!({"text": "buy milk"}).as_object().cloned().unwrap();
/// context.insert("todo", record).await?;
/// assert_eq!(context.pending_operation_count()?, 1);
///
/// let result = context.push().await?;
/// assert_eq!(result.pushed, 1);
/// assert_eq!(context.pending_operation_count()?, 0);
/// # Ok(())
/// # }
/// ```
pub struct SyncContext<S, T> {
    handle: StoreHandle<S>,
    transport: T,
    push_runner: TaskRunner,
    pull_runner: TaskRunner,
    push_state: RwLock<PushState>,
    stats: RwLock<SyncStats>,
    initialized: AtomicBool,
}

impl<S: LocalStore, T: TableTransport> SyncContext<S, T> {
    /// Creates a context. Call [`SyncContext::initialize`] before use.
    pub fn new(store: S, transport: T, config: SyncConfig) -> Self {
        let store = Arc::new(store);
        let operations = Arc::new(OperationTableManager::new(
            Arc::clone(&store),
            config.operation_table.clone(),
            config.config_table.clone(),
        ));
        Self {
            handle: StoreHandle {
                store,
                runner: TaskRunner::new(),
                operations,
                config: Arc::new(config),
            },
            transport,
            push_runner: TaskRunner::new(),
            pull_runner: TaskRunner::new(),
            push_state: RwLock::new(PushState::Idle),
            stats: RwLock::new(SyncStats::default()),
            initialized: AtomicBool::new(false),
        }
    }

    /// The local store.
    pub fn store(&self) -> &S {
        &self.handle.store
    }

    /// The remote table service.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.handle.config
    }

    /// The operation log.
    pub fn operations(&self) -> &OperationTableManager<S> {
        &self.handle.operations
    }

    /// Defines the system tables and loads the operation id high-water
    /// mark. Safe to call again.
    ///
    /// # Errors
    ///
    /// Fails for an invalid configuration or if the schema cannot be
    /// created.
    pub async fn initialize(&self) -> SyncResult<()> {
        self.handle.config.validate()?;
        self.handle
            .run(|handle| {
                handle.operations.initialize()?;
                handle
                    .store
                    .define_table(&checkpoint_table_definition(&handle.config.config_table))?;
                Ok(())
            })
            .await?;
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            max_operation_id = self.handle.operations.max_operation_id(),
            "sync context initialized"
        );
        Ok(())
    }

    /// Returns true once [`SyncContext::initialize`] succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> SyncResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(SyncError::NotInitialized)
        }
    }

    /// Creates or evolves an application table.
    ///
    /// # Errors
    ///
    /// Fails for reserved table names and malformed definitions.
    pub async fn define_table(&self, definition: &TableDefinition) -> SyncResult<()> {
        check_table_name(&definition.name)?;
        self.handle
            .run(|handle| Ok(handle.store.define_table(definition)?))
            .await
    }

    /// Inserts a record locally and logs the insert.
    ///
    /// A GUID `id` is generated if the record has none or a null one.
    /// Returns the stored record.
    ///
    /// # Errors
    ///
    /// Fails if the id is invalid or already present, if a delete of the
    /// same id is still pending, or on storage errors.
    pub async fn insert(&self, table: &str, mut record: Record) -> SyncResult<Record> {
        self.ensure_initialized()?;
        check_table_name(table)?;
        if record.get(ID_FIELD).map_or(true, Value::is_null) {
            record.insert(
                ID_FIELD.into(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        let id = record_key(&record)?;
        self.mutate(table, OperationAction::Insert, id, Some(record.clone()))
            .await?;
        Ok(record)
    }

    /// Replaces a local record and logs the update.
    ///
    /// # Errors
    ///
    /// Fails if the record has no valid id or does not exist locally, or
    /// on storage errors.
    pub async fn update(&self, table: &str, record: Record) -> SyncResult<Record> {
        self.ensure_initialized()?;
        check_table_name(table)?;
        let id = record_key(&record)?;
        self.mutate(table, OperationAction::Update, id, Some(record.clone()))
            .await?;
        Ok(record)
    }

    /// Deletes a local record and logs the delete.
    ///
    /// # Errors
    ///
    /// Fails if the id is invalid or does not exist locally, or on
    /// storage errors.
    pub async fn delete(&self, table: &str, id: &RecordId) -> SyncResult<()> {
        self.ensure_initialized()?;
        check_table_name(table)?;
        let id = validate_record_id(&id.to_value())?;
        self.mutate(table, OperationAction::Delete, id, None).await
    }

    async fn mutate(
        &self,
        table: &str,
        action: OperationAction,
        id: RecordId,
        record: Option<Record>,
    ) -> SyncResult<()> {
        self.handle
            .run(|handle| {
                let exists = handle.store.lookup(table, &id)?.is_some();
                match action {
                    OperationAction::Insert if exists => {
                        return Err(SyncError::RecordAlreadyExists {
                            table: table.to_string(),
                            id,
                        });
                    }
                    OperationAction::Update | OperationAction::Delete if !exists => {
                        return Err(SyncError::RecordNotFound {
                            table: table.to_string(),
                            id,
                        });
                    }
                    _ => {}
                }

                let logging = handle.operations.get_logging_operation(table, action, &id)?;
                let mut batch = Vec::with_capacity(2);
                batch.push(match record {
                    Some(record) => BatchOperation::upsert(table, record),
                    None => BatchOperation::delete(table, id.clone()),
                });
                batch.extend(handle.operations.logging_batch(&logging));
                handle.store.execute_batch(&batch)?;

                debug!(table, item_id = %id, %action, "local change logged");
                Ok(())
            })
            .await
    }

    /// Reads one local record.
    ///
    /// # Errors
    ///
    /// Fails if the table is not defined.
    pub fn lookup(&self, table: &str, id: &RecordId) -> SyncResult<Option<Record>> {
        Ok(self.handle.store.lookup(table, id)?)
    }

    /// Runs a query against the local store.
    ///
    /// # Errors
    ///
    /// Fails if the table is not defined or the query is malformed.
    pub fn read(&self, query: &Query) -> SyncResult<ReadResult> {
        Ok(self.handle.store.read(query)?)
    }

    /// Number of operations waiting to be pushed.
    ///
    /// # Errors
    ///
    /// Fails if the operation log cannot be read.
    pub fn pending_operation_count(&self) -> SyncResult<usize> {
        self.handle.operations.pending_count()
    }

    /// Pulls remote changes for `query` into the local store.
    ///
    /// With a `query_id` the pull is incremental: it resumes from the
    /// checkpoint saved by the previous pull with the same id. Records
    /// with pending local operations are never overwritten.
    ///
    /// # Errors
    ///
    /// Fails for queries that use ordering, paging, projection or total
    /// counts, for invalid query ids, and on transport or storage errors.
    pub async fn pull(&self, query: &Query, query_id: Option<&str>) -> SyncResult<PullResult> {
        self.ensure_initialized()?;
        let result = self
            .pull_runner
            .run(|| async move {
                PullEngine::new(&self.handle, &self.transport)
                    .pull(query, query_id)
                    .await
            })
            .await;

        let mut stats = self.stats.write();
        match &result {
            Ok(pulled) => {
                stats.pulls_completed += 1;
                stats.records_pulled += pulled.pulled as u64;
                stats.records_skipped += pulled.skipped_pending as u64;
                stats.last_pull_time = Some(Instant::now());
            }
            Err(error) => stats.last_error = Some(error.to_string()),
        }
        drop(stats);
        result
    }

    /// Pushes every pending operation without a handler: conflicts are
    /// collected and any other failure aborts the push.
    ///
    /// # Errors
    ///
    /// See [`SyncContext::push_with`].
    pub async fn push(&self) -> SyncResult<PushResult<S>> {
        self.push_with(&NoopHandler).await
    }

    /// Pushes every pending operation, oldest first, offering failures to
    /// `handler`.
    ///
    /// Unhandled 412 conflicts are skipped and returned in the result;
    /// other pushes continue.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::PushAborted`] for an unhandled non-412
    /// failure. Operations pushed before it stay pushed.
    pub async fn push_with<H: PushHandler<S>>(&self, handler: &H) -> SyncResult<PushResult<S>> {
        self.ensure_initialized()?;
        let result = self
            .push_runner
            .run(|| async move {
                PushEngine::new(&self.handle, &self.transport, &self.push_state)
                    .push(handler)
                    .await
            })
            .await;

        let mut stats = self.stats.write();
        match &result {
            Ok(pushed) => {
                stats.pushes_completed += 1;
                stats.operations_pushed += pushed.pushed as u64;
                stats.conflicts_encountered += pushed.conflicts.len() as u64;
                stats.last_push_time = Some(Instant::now());
            }
            Err(error) => stats.last_error = Some(error.to_string()),
        }
        drop(stats);
        result
    }

    /// Current push state.
    pub fn push_state(&self) -> PushState {
        *self.push_state.read()
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }
}

fn check_table_name(table: &str) -> SyncResult<()> {
    validate_table_name(table)?;
    if is_system_table(table) {
        return Err(SyncError::InvalidTableName(table.to_string()));
    }
    Ok(())
}

fn record_key(record: &Record) -> SyncResult<RecordId> {
    match record.get(ID_FIELD) {
        Some(value) => Ok(validate_record_id(value)?),
        None => Err(SyncError::InvalidRecord("record has no id".into())),
    }
}
