//! File-backed local store.

use crate::backend::LocalStore;
use crate::batch::BatchOperation;
use crate::error::{StoreError, StoreResult};
use crate::memory::{deletes, upserts, MemoryStore, StoreState};
use crate::query::{Query, ReadResult};
use crate::record::{Record, RecordId};
use crate::table::TableDefinition;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Snapshot file name inside the store directory.
const SNAPSHOT_FILE: &str = "store.json";
/// Temporary file the next snapshot is written to before the rename.
const SNAPSHOT_TMP_FILE: &str = "store.json.tmp";
/// Lock file name.
const LOCK_FILE: &str = "LOCK";

/// A local store persisted as a JSON snapshot in a directory.
///
/// All reads are served from memory. Every committed mutation rewrites
/// the snapshot to a temporary file, syncs it, and renames it over the
/// previous one, so after a crash the directory holds either the state
/// before or the state after the mutation, never a mix.
///
/// # Locking
///
/// The directory is locked exclusively for the lifetime of the store;
/// opening it again from another handle fails with [`StoreError::Locked`].
///
/// # Example
///
/// ```no_run
/// use tablesync_store::{ColumnType, FileStore, LocalStore, TableDefinition};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("app-data")).unwrap();
/// store
///     .define_table(&TableDefinition::new("todo").column("id", ColumnType::String))
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    memory: MemoryStore,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store in the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, is locked by
    /// another handle, or holds an unreadable snapshot.
    pub fn open(path: &Path) -> StoreResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        // A leftover temp file is an interrupted write; the snapshot it
        // would have replaced is still intact.
        let tmp = path.join(SNAPSHOT_TMP_FILE);
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }

        let snapshot = path.join(SNAPSHOT_FILE);
        let state = if snapshot.exists() {
            let bytes = fs::read(&snapshot)?;
            serde_json::from_slice::<StoreState>(&bytes)?
        } else {
            StoreState::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            memory: MemoryStore::from_state(state),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of rows in a table, or zero if it is undefined.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.memory.row_count(table)
    }

    fn write_snapshot(&self, state: &StoreState) -> StoreResult<()> {
        let bytes = serde_json::to_vec(state)?;
        let tmp = self.path.join(SNAPSHOT_TMP_FILE);

        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, self.path.join(SNAPSHOT_FILE))?;
        Ok(())
    }

    fn commit<F>(&self, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut StoreState) -> StoreResult<()>,
    {
        self.memory
            .commit_with(mutate, |staged| self.write_snapshot(staged))
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> StoreState {
        self.memory.snapshot()
    }
}

impl LocalStore for FileStore {
    fn define_table(&self, definition: &TableDefinition) -> StoreResult<()> {
        self.commit(|state| state.define_table(definition))
    }

    fn upsert(&self, table: &str, records: &[Record]) -> StoreResult<()> {
        let operations = upserts(table, records);
        self.commit(|state| state.apply_batch(&operations, None))
    }

    fn lookup(&self, table: &str, id: &RecordId) -> StoreResult<Option<Record>> {
        self.memory.lookup(table, id)
    }

    fn delete(&self, table: &str, ids: &[RecordId]) -> StoreResult<()> {
        let operations = deletes(table, ids);
        self.commit(|state| state.apply_batch(&operations, None))
    }

    fn read(&self, query: &Query) -> StoreResult<ReadResult> {
        self.memory.read(query)
    }

    fn execute_batch(&self, operations: &[BatchOperation]) -> StoreResult<()> {
        self.commit(|state| state.apply_batch(operations, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnType;
    use serde_json::json;
    use tempfile::tempdir;

    fn todo_table() -> TableDefinition {
        TableDefinition::new("todo")
            .column("id", ColumnType::String)
            .column("text", ColumnType::String)
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).unwrap();
            store.define_table(&todo_table()).unwrap();
            store
                .upsert_one("todo", record(json!({"id": "a", "text": "milk"})))
                .unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let found = store.lookup("todo", &RecordId::from("A")).unwrap().unwrap();
        assert_eq!(found["text"], json!("milk"));
        assert_eq!(store.row_count("todo"), 1);
    }

    #[test]
    fn file_store_is_locked_while_open() {
        let dir = tempdir().unwrap();
        let _store = FileStore::open(dir.path()).unwrap();

        let second = FileStore::open(dir.path());
        assert!(matches!(second, Err(StoreError::Locked)));
    }

    #[test]
    fn failed_batch_is_not_persisted() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.define_table(&todo_table()).unwrap();
            let batch = vec![
                BatchOperation::upsert("todo", record(json!({"id": "a"}))),
                BatchOperation::upsert("missing", record(json!({"id": "b"}))),
            ];
            assert!(store.execute_batch(&batch).is_err());
            assert_eq!(store.snapshot().tables["todo"].rows.len(), 0);
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.row_count("todo"), 0);
    }

    #[test]
    fn leftover_temp_file_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.define_table(&todo_table()).unwrap();
            store.upsert_one("todo", record(json!({"id": "a"}))).unwrap();
        }
        fs::write(dir.path().join(SNAPSHOT_TMP_FILE), b"{ half written").unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.row_count("todo"), 1);
        assert!(!dir.path().join(SNAPSHOT_TMP_FILE).exists());
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), b"not json").unwrap();
        assert!(matches!(
            FileStore::open(dir.path()),
            Err(StoreError::Serialization(_))
        ));
    }
}
