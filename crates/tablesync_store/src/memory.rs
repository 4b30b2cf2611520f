//! In-memory local store.

use crate::backend::LocalStore;
use crate::batch::BatchOperation;
use crate::error::{StoreError, StoreResult};
use crate::query::{evaluate, Query, ReadResult};
use crate::record::{Record, RecordId, ID_FIELD};
use crate::table::TableDefinition;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Rows of one table keyed by normalized record id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredTable {
    pub(crate) definition: TableDefinition,
    pub(crate) rows: BTreeMap<String, Record>,
}

/// Row key of `record`, which must carry a valid id.
fn row_key(table: &str, record: &Record) -> StoreResult<String> {
    let raw_id = record
        .get(ID_FIELD)
        .ok_or_else(|| StoreError::MissingId(table.to_string()))?;
    let id = RecordId::from_value(raw_id).ok_or_else(|| StoreError::InvalidId {
        table: table.to_string(),
        id: raw_id.to_string(),
    })?;
    Ok(id.key())
}

/// The full contents of a store. Also the on-disk snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub(crate) tables: BTreeMap<String, StoredTable>,
}

impl StoreState {
    pub(crate) fn define_table(&mut self, definition: &TableDefinition) -> StoreResult<()> {
        definition.validate()?;
        match self.tables.entry(definition.name.clone()) {
            Entry::Occupied(mut existing) => existing.get_mut().definition.merge(definition),
            Entry::Vacant(slot) => {
                slot.insert(StoredTable {
                    definition: definition.clone(),
                    rows: BTreeMap::new(),
                });
            }
        }
        Ok(())
    }

    fn table(&self, name: &str) -> StoreResult<&StoredTable> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::TableNotDefined(name.to_string()))
    }

    pub(crate) fn lookup(&self, table: &str, id: &RecordId) -> StoreResult<Option<Record>> {
        Ok(self.table(table)?.rows.get(&id.key()).cloned())
    }

    pub(crate) fn read(&self, query: &Query) -> StoreResult<ReadResult> {
        evaluate(query, self.table(&query.table)?.rows.values())
    }

    /// Stages the rows `operations` write and applies them only when
    /// every step succeeded. `None` stages a delete.
    ///
    /// `fail_after` aborts the batch once that many steps were staged.
    pub(crate) fn apply_batch(
        &mut self,
        operations: &[BatchOperation],
        fail_after: Option<usize>,
    ) -> StoreResult<()> {
        let mut staged: Vec<(&str, String, Option<&Record>)> =
            Vec::with_capacity(operations.len());

        for (index, operation) in operations.iter().enumerate() {
            if fail_after == Some(index) {
                return Err(StoreError::BatchFailed {
                    applied: index,
                    reason: "injected failure".into(),
                });
            }

            let name = operation.table();
            self.table(name)?;
            staged.push(match operation {
                BatchOperation::Upsert { data, .. } => (name, row_key(name, data)?, Some(data)),
                BatchOperation::Delete { id, .. } => (name, id.key(), None),
            });
        }

        for (name, key, row) in staged {
            let Some(table) = self.tables.get_mut(name) else {
                continue;
            };
            match row {
                Some(record) => {
                    table.rows.insert(key, record.clone());
                }
                None => {
                    table.rows.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// An in-memory local store.
///
/// This store keeps all tables in memory and is suitable for:
/// - Unit and integration tests
/// - Ephemeral caches that don't need persistence
///
/// # Thread Safety
///
/// The store is shared behind an `RwLock`; batches are staged and applied
/// under the write lock, so readers never observe a partial batch.
///
/// # Example
///
/// ```rust
/// use tablesync_store::{ColumnType, LocalStore, MemoryStore, RecordId, TableDefinition};
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store
///     .define_table(&TableDefinition::new("todo").column("id", ColumnType::String))
///     .unwrap();
/// let record = json!({"id": "A1", "text": "milk"}).as_object().cloned().unwrap();
/// store.upsert_one("todo", record).unwrap();
/// assert!(store.lookup("todo", &RecordId::from("a1")).unwrap().is_some());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    injected_failure: Mutex<Option<usize>>,
}

impl MemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
            injected_failure: Mutex::new(None),
        }
    }

    /// Makes the next `execute_batch` fail after staging `applied` steps.
    ///
    /// Useful for testing that a failed batch leaves no trace.
    pub fn fail_next_batch_after(&self, applied: usize) {
        *self.injected_failure.lock() = Some(applied);
    }

    /// Returns the names of all defined tables.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.state.read().tables.keys().cloned().collect()
    }

    /// Returns the number of rows in a table, or zero if it is undefined.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .read()
            .tables
            .get(table)
            .map_or(0, |stored| stored.rows.len())
    }

    /// Returns the definition of a table.
    #[must_use]
    pub fn table_definition(&self, table: &str) -> Option<TableDefinition> {
        self.state
            .read()
            .tables
            .get(table)
            .map(|stored| stored.definition.clone())
    }

    pub(crate) fn snapshot(&self) -> StoreState {
        self.state.read().clone()
    }

    /// Runs `mutate` against a copy of the state and commits it only after
    /// `persist` accepted the result.
    pub(crate) fn commit_with<F, P>(&self, mutate: F, persist: P) -> StoreResult<()>
    where
        F: FnOnce(&mut StoreState) -> StoreResult<()>,
        P: FnOnce(&StoreState) -> StoreResult<()>,
    {
        let mut state = self.state.write();
        let mut staged = state.clone();
        mutate(&mut staged)?;
        persist(&staged)?;
        *state = staged;
        Ok(())
    }

    pub(crate) fn take_injected_failure(&self) -> Option<usize> {
        self.injected_failure.lock().take()
    }
}

pub(crate) fn upserts(table: &str, records: &[Record]) -> Vec<BatchOperation> {
    records
        .iter()
        .map(|record| BatchOperation::upsert(table, record.clone()))
        .collect()
}

pub(crate) fn deletes(table: &str, ids: &[RecordId]) -> Vec<BatchOperation> {
    ids.iter()
        .map(|id| BatchOperation::delete(table, id.clone()))
        .collect()
}

impl LocalStore for MemoryStore {
    fn define_table(&self, definition: &TableDefinition) -> StoreResult<()> {
        self.state.write().define_table(definition)
    }

    fn upsert(&self, table: &str, records: &[Record]) -> StoreResult<()> {
        self.state
            .write()
            .apply_batch(&upserts(table, records), None)
    }

    fn lookup(&self, table: &str, id: &RecordId) -> StoreResult<Option<Record>> {
        self.state.read().lookup(table, id)
    }

    fn delete(&self, table: &str, ids: &[RecordId]) -> StoreResult<()> {
        self.state.write().apply_batch(&deletes(table, ids), None)
    }

    fn read(&self, query: &Query) -> StoreResult<ReadResult> {
        self.state.read().read(query)
    }

    fn execute_batch(&self, operations: &[BatchOperation]) -> StoreResult<()> {
        let fail_after = self.take_injected_failure();
        self.state.write().apply_batch(operations, fail_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnType;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn store_with_tables() -> MemoryStore {
        let store = MemoryStore::new();
        for name in ["todo", "log"] {
            store
                .define_table(&TableDefinition::new(name).column("id", ColumnType::String))
                .unwrap();
        }
        store
    }

    #[test]
    fn memory_new_is_empty() {
        let store = MemoryStore::new();
        assert!(store.table_names().is_empty());
        assert_eq!(store.row_count("todo"), 0);
    }

    #[test]
    fn define_table_is_idempotent_and_adds_columns() {
        let store = store_with_tables();
        store
            .define_table(
                &TableDefinition::new("todo")
                    .column("id", ColumnType::String)
                    .column("done", ColumnType::Boolean),
            )
            .unwrap();
        let definition = store.table_definition("todo").unwrap();
        assert_eq!(definition.columns.get("done"), Some(&ColumnType::Boolean));
        assert_eq!(store.table_names().len(), 2);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let store = store_with_tables();
        store
            .upsert_one("todo", record(json!({"id": "a", "text": "one"})))
            .unwrap();
        store
            .upsert_one("todo", record(json!({"id": "A", "text": "two"})))
            .unwrap();

        assert_eq!(store.row_count("todo"), 1);
        let found = store.lookup("todo", &RecordId::from("a")).unwrap().unwrap();
        assert_eq!(found["text"], json!("two"));
    }

    #[test]
    fn writes_to_undefined_table_fail() {
        let store = MemoryStore::new();
        let result = store.upsert_one("missing", record(json!({"id": "a"})));
        assert!(matches!(result, Err(StoreError::TableNotDefined(_))));
        assert!(store.lookup("missing", &RecordId::from("a")).is_err());
    }

    #[test]
    fn upsert_requires_valid_id() {
        let store = store_with_tables();
        assert!(matches!(
            store.upsert_one("todo", record(json!({"text": "x"}))),
            Err(StoreError::MissingId(_))
        ));
        assert!(matches!(
            store.upsert_one("todo", record(json!({"id": true}))),
            Err(StoreError::InvalidId { .. })
        ));
    }

    #[test]
    fn delete_ignores_absent_ids() {
        let store = store_with_tables();
        store.upsert_one("todo", record(json!({"id": "a"}))).unwrap();
        store
            .delete("todo", &[RecordId::from("a"), RecordId::from("zzz")])
            .unwrap();
        assert_eq!(store.row_count("todo"), 0);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let store = store_with_tables();
        store.upsert_one("todo", record(json!({"id": "keep"}))).unwrap();

        let batch = vec![
            BatchOperation::upsert("todo", record(json!({"id": "a"}))),
            BatchOperation::delete("todo", RecordId::from("keep")),
            BatchOperation::upsert("undefined", record(json!({"id": "b"}))),
        ];
        assert!(store.execute_batch(&batch).is_err());

        assert_eq!(store.row_count("todo"), 1);
        assert!(store.lookup("todo", &RecordId::from("keep")).unwrap().is_some());
    }

    #[test]
    fn batch_touches_only_its_rows_in_order() {
        let store = store_with_tables();
        store
            .upsert("todo", &[record(json!({"id": "keep"})), record(json!({"id": "gone"}))])
            .unwrap();

        let batch = vec![
            BatchOperation::upsert("todo", record(json!({"id": "a", "text": "one"}))),
            BatchOperation::delete("todo", RecordId::from("A")),
            BatchOperation::upsert("todo", record(json!({"id": "b", "text": "one"}))),
            BatchOperation::upsert("todo", record(json!({"id": "B", "text": "two"}))),
            BatchOperation::delete("todo", RecordId::from("gone")),
        ];
        store.execute_batch(&batch).unwrap();

        assert_eq!(store.row_count("todo"), 2);
        assert!(store.lookup("todo", &RecordId::from("keep")).unwrap().is_some());
        assert!(store.lookup("todo", &RecordId::from("a")).unwrap().is_none());
        let b = store.lookup("todo", &RecordId::from("b")).unwrap().unwrap();
        assert_eq!(b["text"], json!("two"));
    }

    #[test]
    fn injected_failure_discards_staged_steps() {
        let store = store_with_tables();
        store.fail_next_batch_after(1);

        let batch = vec![
            BatchOperation::upsert("todo", record(json!({"id": "a"}))),
            BatchOperation::upsert("log", record(json!({"id": "1"}))),
        ];
        let result = store.execute_batch(&batch);
        assert!(matches!(result, Err(StoreError::BatchFailed { applied: 1, .. })));
        assert_eq!(store.row_count("todo"), 0);
        assert_eq!(store.row_count("log"), 0);

        // The failure is one-shot.
        store.execute_batch(&batch).unwrap();
        assert_eq!(store.row_count("todo"), 1);
        assert_eq!(store.row_count("log"), 1);
    }

    proptest::proptest! {
        #[test]
        fn failed_batch_never_changes_state(
            ids in proptest::collection::vec("[a-e]{1,3}", 1..8),
            fail_at in 0usize..8,
        ) {
            let store = store_with_tables();
            store.upsert_one("todo", record(json!({"id": "seed"}))).unwrap();

            let batch: Vec<_> = ids
                .iter()
                .map(|id| BatchOperation::upsert("todo", record(json!({"id": id}))))
                .collect();
            store.fail_next_batch_after(fail_at % batch.len());

            proptest::prop_assert!(store.execute_batch(&batch).is_err());
            proptest::prop_assert_eq!(store.row_count("todo"), 1);
        }
    }

    #[test]
    fn read_evaluates_query() {
        let store = store_with_tables();
        store
            .upsert(
                "todo",
                &[
                    record(json!({"id": "a", "rank": 2})),
                    record(json!({"id": "b", "rank": 1})),
                ],
            )
            .unwrap();

        let result = store
            .read(&Query::new("todo").order_by("rank").take(1))
            .unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0]["id"], json!("b"));
    }
}
