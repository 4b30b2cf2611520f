//! The operation log table.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tablesync_protocol::{
    operation_table_definition, plan_logging, LoggingOperation, OperationAction,
    OperationLogRecord, TABLE_NAME_FIELD,
};
use tablesync_store::{
    BatchOperation, ColumnType, FilterOp, LocalStore, Query, Record, RecordId, TableDefinition,
    ID_FIELD,
};
use tracing::debug;

const MARK_FIELD: &str = "value";

/// Owns the operation log: id allocation, condensation and the push lock.
///
/// # Invariants
///
/// - Operation ids strictly increase and are never reused, also across
///   restarts: every append persists the high-water mark in the config
///   table, and `initialize()` resumes from it
/// - At most one operation is locked at a time
/// - A locked operation is never condensed; new mutations of the same
///   record are appended beside it
///
/// # Thread Safety
///
/// Condensation reads and then decides, so callers must serialize
/// `get_logging_operation` with the batches that apply its result (the
/// sync context does this through its store runner).
pub struct OperationTableManager<S> {
    store: Arc<S>,
    table: String,
    config_table: String,
    max_operation_id: Mutex<u64>,
    locked_operation_id: Mutex<Option<u64>>,
}

impl<S: LocalStore> OperationTableManager<S> {
    /// Creates a manager for the log table `table` in `store`. The id
    /// high-water mark is kept in `config_table`.
    pub fn new(store: Arc<S>, table: impl Into<String>, config_table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            config_table: config_table.into(),
            max_operation_id: Mutex::new(0),
            locked_operation_id: Mutex::new(None),
        }
    }

    /// Name of the log table.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Defines the log table and loads the highest id ever assigned:
    /// the larger of the persisted mark and the newest stored entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the schema cannot be created or read.
    pub fn initialize(&self) -> SyncResult<()> {
        self.store
            .define_table(&operation_table_definition(&self.table))?;
        self.store.define_table(
            &TableDefinition::new(&self.config_table)
                .column(ID_FIELD, ColumnType::String)
                .column(MARK_FIELD, ColumnType::Integer),
        )?;

        let newest = self
            .store
            .read(&Query::new(&self.table).order_by_descending(ID_FIELD).take(1))?;
        let stored_max = match newest.records.first() {
            Some(row) => OperationLogRecord::from_record(row)?.id,
            None => 0,
        };

        let persisted = self
            .store
            .lookup(&self.config_table, &self.mark_key())?
            .and_then(|row| row.get(MARK_FIELD).and_then(Value::as_u64))
            .unwrap_or(0);

        let mut max = self.max_operation_id.lock();
        *max = (*max).max(stored_max).max(persisted);
        debug!(table = %self.table, max_operation_id = *max, "operation log initialized");
        Ok(())
    }

    /// Highest operation id assigned so far.
    pub fn max_operation_id(&self) -> u64 {
        *self.max_operation_id.lock()
    }

    fn mark_key(&self) -> RecordId {
        RecordId::from(format!("maxOperationId|{}", self.table))
    }

    fn next_operation_id(&self) -> u64 {
        let mut max = self.max_operation_id.lock();
        *max += 1;
        *max
    }

    /// Computes how logging `action` on `(table_name, item_id)` changes
    /// the log. Nothing is written; the caller adds the result to the
    /// batch carrying the data mutation.
    ///
    /// # Errors
    ///
    /// Fails for unsupported action sequences (e.g. insert after a
    /// pending delete) and for storage errors.
    pub fn get_logging_operation(
        &self,
        table_name: &str,
        action: OperationAction,
        item_id: &RecordId,
    ) -> SyncResult<LoggingOperation> {
        let pending = self.read_pending_operations(table_name, item_id)?;
        let logging = plan_logging(
            pending.last(),
            self.locked_operation_id(),
            table_name,
            action,
            item_id,
            || self.next_operation_id(),
        )?;
        debug!(table = table_name, %item_id, %action, ?logging, "condensed");
        Ok(logging)
    }

    /// Batch steps writing `logging` to the log. An append also persists
    /// the new high-water mark.
    pub fn logging_batch(&self, logging: &LoggingOperation) -> Vec<BatchOperation> {
        let mut batch: Vec<_> = logging.to_batch(&self.table).into_iter().collect();
        if let LoggingOperation::Append(entry) = logging {
            let mut mark = Record::new();
            mark.insert(ID_FIELD.into(), self.mark_key().to_value());
            mark.insert(MARK_FIELD.into(), Value::from(entry.id));
            batch.push(BatchOperation::upsert(&self.config_table, mark));
        }
        batch
    }

    /// Marks `id` as being pushed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::OperationLocked`] if another id is locked.
    pub fn lock_operation(&self, id: u64) -> SyncResult<()> {
        let mut locked = self.locked_operation_id.lock();
        match *locked {
            Some(current) if current != id => Err(SyncError::OperationLocked {
                locked: current,
                requested: id,
            }),
            _ => {
                *locked = Some(id);
                Ok(())
            }
        }
    }

    /// Clears the lock.
    pub fn unlock_operation(&self) {
        *self.locked_operation_id.lock() = None;
    }

    /// Currently locked operation, if any.
    pub fn locked_operation_id(&self) -> Option<u64> {
        *self.locked_operation_id.lock()
    }

    /// All log rows for a record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or holds a bad row.
    pub fn read_pending_operations(
        &self,
        table_name: &str,
        item_id: &RecordId,
    ) -> SyncResult<Vec<OperationLogRecord>> {
        let rows = self.store.read(
            &Query::new(&self.table)
                .filter_eq(TABLE_NAME_FIELD, table_name)
                .order_by(ID_FIELD),
        )?;

        // Text ids match case-insensitively, which the store filter does not.
        let mut pending = Vec::new();
        for row in &rows.records {
            let entry = OperationLogRecord::from_record(row)?;
            if entry.targets(table_name, item_id) {
                pending.push(entry);
            }
        }
        Ok(pending)
    }

    /// Storage keys of every record of `table_name` with a log row, read
    /// in one pass over the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or holds a bad row.
    pub fn pending_item_keys(&self, table_name: &str) -> SyncResult<HashSet<String>> {
        let rows = self
            .store
            .read(&Query::new(&self.table).filter_eq(TABLE_NAME_FIELD, table_name))?;
        rows.records
            .iter()
            .map(|row| Ok(OperationLogRecord::from_record(row)?.item_id.key()))
            .collect()
    }

    /// Returns true if the record has any log row.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn has_pending_operations(&self, table_name: &str, item_id: &RecordId) -> SyncResult<bool> {
        Ok(!self.read_pending_operations(table_name, item_id)?.is_empty())
    }

    /// The oldest log row with an id greater than `after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn read_oldest_after(&self, after: Option<u64>) -> SyncResult<Option<OperationLogRecord>> {
        let mut query = Query::new(&self.table).order_by(ID_FIELD).take(1);
        if let Some(after) = after {
            query = query.filter(ID_FIELD, FilterOp::Gt, after);
        }
        self.store
            .read(&query)?
            .records
            .first()
            .map(OperationLogRecord::from_record)
            .transpose()
            .map_err(SyncError::from)
    }

    /// Loads one log row by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn read_operation(&self, id: u64) -> SyncResult<Option<OperationLogRecord>> {
        let Ok(key) = i64::try_from(id) else {
            return Ok(None);
        };
        self.store
            .lookup(&self.table, &RecordId::Number(key))?
            .as_ref()
            .map(OperationLogRecord::from_record)
            .transpose()
            .map_err(SyncError::from)
    }

    /// Number of rows in the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn pending_count(&self) -> SyncResult<usize> {
        let result = self
            .store
            .read(&Query::new(&self.table).include_total_count().take(0))?;
        Ok(result.total_count.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tablesync_store::MemoryStore;

    fn manager() -> OperationTableManager<MemoryStore> {
        let manager =
            OperationTableManager::new(Arc::new(MemoryStore::new()), "__operations", "__config");
        manager.initialize().unwrap();
        manager
    }

    fn apply(manager: &OperationTableManager<MemoryStore>, logging: &LoggingOperation) {
        manager
            .store
            .execute_batch(&manager.logging_batch(logging))
            .unwrap();
    }

    fn log(
        manager: &OperationTableManager<MemoryStore>,
        action: OperationAction,
        id: &str,
    ) -> SyncResult<LoggingOperation> {
        let logging = manager.get_logging_operation("todo", action, &id.into())?;
        apply(manager, &logging);
        Ok(logging)
    }

    #[test]
    fn empty_log_starts_at_zero() {
        let manager = manager();
        assert_eq!(manager.max_operation_id(), 0);
        assert_eq!(manager.pending_count().unwrap(), 0);
        assert_eq!(manager.read_oldest_after(None).unwrap(), None);
    }

    #[test]
    fn appends_then_condenses() {
        let manager = manager();
        log(&manager, OperationAction::Insert, "a").unwrap();
        assert_eq!(
            log(&manager, OperationAction::Update, "a").unwrap(),
            LoggingOperation::Nop
        );
        assert!(matches!(
            log(&manager, OperationAction::Delete, "a").unwrap(),
            LoggingOperation::Remove(_)
        ));
        assert!(manager
            .read_pending_operations("todo", &"a".into())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unsupported_sequence_leaves_log_unchanged() {
        let manager = manager();
        log(&manager, OperationAction::Update, "a").unwrap();
        log(&manager, OperationAction::Delete, "a").unwrap();
        let before = manager.read_pending_operations("todo", &"a".into()).unwrap();

        let result = log(&manager, OperationAction::Insert, "a");
        assert!(matches!(result, Err(SyncError::Condensation(_))));
        assert_eq!(
            manager.read_pending_operations("todo", &"a".into()).unwrap(),
            before
        );
        assert_eq!(before[0].action, OperationAction::Delete);
    }

    #[test]
    fn pending_lookup_is_case_insensitive() {
        let manager = manager();
        log(&manager, OperationAction::Insert, "ABC").unwrap();
        assert!(manager
            .has_pending_operations("todo", &"abc".into())
            .unwrap());
        assert!(!manager
            .has_pending_operations("other", &"abc".into())
            .unwrap());
    }

    #[test]
    fn pending_item_keys_cover_one_table() {
        let manager = manager();
        log(&manager, OperationAction::Insert, "ABC").unwrap();
        log(&manager, OperationAction::Insert, "def").unwrap();
        let other = manager
            .get_logging_operation("other", OperationAction::Insert, &"x".into())
            .unwrap();
        apply(&manager, &other);

        let keys = manager.pending_item_keys("todo").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&RecordId::from("abc").key()));
        assert!(!keys.contains(&RecordId::from("x").key()));
    }

    #[test]
    fn locked_entry_gets_a_sibling() {
        let manager = manager();
        log(&manager, OperationAction::Insert, "a").unwrap();
        let first = manager.read_oldest_after(None).unwrap().unwrap();

        manager.lock_operation(first.id).unwrap();
        log(&manager, OperationAction::Update, "a").unwrap();
        manager.unlock_operation();

        let pending = manager.read_pending_operations("todo", &"a".into()).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], first);
        assert_eq!(pending[1].action, OperationAction::Update);
        assert!(pending[1].id > first.id);
    }

    #[test]
    fn only_one_operation_can_be_locked() {
        let manager = manager();
        manager.lock_operation(3).unwrap();
        manager.lock_operation(3).unwrap();
        assert!(matches!(
            manager.lock_operation(4),
            Err(SyncError::OperationLocked {
                locked: 3,
                requested: 4
            })
        ));
        manager.unlock_operation();
        manager.lock_operation(4).unwrap();
        assert_eq!(manager.locked_operation_id(), Some(4));
    }

    #[test]
    fn ids_survive_reinitialization() {
        let store = Arc::new(MemoryStore::new());
        let first = OperationTableManager::new(Arc::clone(&store), "__operations", "__config");
        first.initialize().unwrap();
        for id in ["a", "b", "c"] {
            log(&first, OperationAction::Insert, id).unwrap();
        }
        // Removing an older row leaves the high-water mark in place.
        let newest = first.read_operation(3).unwrap().unwrap();
        store
            .execute_batch(&[BatchOperation::delete("__operations", RecordId::Number(1))])
            .unwrap();

        let second = OperationTableManager::new(Arc::clone(&store), "__operations", "__config");
        second.initialize().unwrap();
        assert_eq!(second.max_operation_id(), newest.id);
        let next = log(&second, OperationAction::Insert, "d").unwrap();
        assert!(matches!(next, LoggingOperation::Append(entry) if entry.id == 4));
    }

    #[test]
    fn ids_survive_a_drained_log() {
        let store = Arc::new(MemoryStore::new());
        let first = OperationTableManager::new(Arc::clone(&store), "__operations", "__config");
        first.initialize().unwrap();
        for id in ["a", "b"] {
            log(&first, OperationAction::Insert, id).unwrap();
        }
        let drained: Vec<_> = (1..=2)
            .map(|id| BatchOperation::delete("__operations", RecordId::Number(id)))
            .collect();
        store.execute_batch(&drained).unwrap();
        assert_eq!(first.pending_count().unwrap(), 0);

        let second = OperationTableManager::new(Arc::clone(&store), "__operations", "__config");
        second.initialize().unwrap();
        assert_eq!(second.max_operation_id(), 2);
        let next = log(&second, OperationAction::Insert, "c").unwrap();
        assert!(matches!(next, LoggingOperation::Append(entry) if entry.id == 3));
    }

    #[test]
    fn oldest_after_skips_processed_ids() {
        let manager = manager();
        for id in ["a", "b", "c"] {
            log(&manager, OperationAction::Insert, id).unwrap();
        }
        let oldest = manager.read_oldest_after(None).unwrap().unwrap();
        assert_eq!(oldest.id, 1);
        let next = manager.read_oldest_after(Some(1)).unwrap().unwrap();
        assert_eq!(next.item_id, RecordId::from("b"));
        assert_eq!(manager.read_oldest_after(Some(3)).unwrap(), None);
        assert_eq!(manager.pending_count().unwrap(), 3);
    }

    fn action_strategy() -> impl Strategy<Value = OperationAction> {
        prop_oneof![
            Just(OperationAction::Insert),
            Just(OperationAction::Update),
            Just(OperationAction::Delete),
        ]
    }

    proptest! {
        #[test]
        fn ids_grow_and_unlocked_entries_stay_unique(
            steps in proptest::collection::vec((action_strategy(), 0..3usize, any::<bool>()), 1..40)
        ) {
            let manager = manager();
            let items = ["a", "b", "c"];
            let mut last_appended = 0;

            for (action, item, push_step) in steps {
                // Simulates a push: lock the oldest entry, later remove it.
                if push_step {
                    match manager.locked_operation_id() {
                        Some(locked) => {
                            let row = RecordId::Number(i64::try_from(locked).unwrap());
                            manager
                                .store
                                .execute_batch(&[BatchOperation::delete(manager.table_name(), row)])
                                .unwrap();
                            manager.unlock_operation();
                        }
                        None => {
                            if let Some(oldest) = manager.read_oldest_after(None).unwrap() {
                                manager.lock_operation(oldest.id).unwrap();
                            }
                        }
                    }
                }

                match log(&manager, action, items[item]) {
                    Ok(LoggingOperation::Append(entry)) => {
                        prop_assert!(entry.id > last_appended);
                        last_appended = entry.id;
                    }
                    Ok(_) | Err(SyncError::Condensation(_)) => {}
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }

                let locked = manager.locked_operation_id();
                for id in items {
                    let unlocked = manager
                        .read_pending_operations("todo", &id.into())
                        .unwrap()
                        .into_iter()
                        .filter(|entry| Some(entry.id) != locked)
                        .count();
                    prop_assert!(unlocked <= 1);
                }
            }
        }
    }
}
