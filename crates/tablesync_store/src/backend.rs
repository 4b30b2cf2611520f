//! Local store trait definition.

use crate::batch::BatchOperation;
use crate::error::{StoreError, StoreResult};
use crate::query::{Query, ReadResult};
use crate::record::{Record, RecordId};
use crate::table::TableDefinition;
use std::sync::Arc;

/// Durable table storage used by the sync engine.
///
/// Stores are shared between the sync context and the push and pull
/// engines, so every method takes `&self` and implementations provide
/// their own interior locking.
///
/// # Invariants
///
/// - `execute_batch` is all-or-nothing: either every step is visible
///   afterwards or none is
/// - `lookup` matches text ids case-insensitively
/// - Tables must be defined before records are written to them
/// - Two separate calls are never atomic with respect to each other;
///   callers needing read-then-write atomicity must serialize access
///   themselves
///
/// # Implementors
///
/// - [`super::MemoryStore`] - For testing and ephemeral state
/// - [`super::FileStore`] - JSON snapshot persisted to disk
pub trait LocalStore: Send + Sync {
    /// Creates a table or evolves its schema.
    ///
    /// Idempotent. New columns are added to an existing table.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is malformed.
    fn define_table(&self, definition: &TableDefinition) -> StoreResult<()>;

    /// Inserts or replaces records by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is undefined or a record lacks a
    /// valid id. No record is written in that case.
    fn upsert(&self, table: &str, records: &[Record]) -> StoreResult<()>;

    /// Returns the record with the given id, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is undefined.
    fn lookup(&self, table: &str, id: &RecordId) -> StoreResult<Option<Record>>;

    /// Removes records by id. Absent ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is undefined.
    fn delete(&self, table: &str, ids: &[RecordId]) -> StoreResult<()>;

    /// Reads the rows of `query.table` matching the query.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is undefined or the query is invalid.
    fn read(&self, query: &Query) -> StoreResult<ReadResult>;

    /// Applies a sequence of upserts and deletes atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; no step is applied then.
    fn execute_batch(&self, operations: &[BatchOperation]) -> StoreResult<()>;

    /// Inserts or replaces a single record.
    ///
    /// # Errors
    ///
    /// See [`LocalStore::upsert`].
    fn upsert_one(&self, table: &str, record: Record) -> StoreResult<()> {
        self.upsert(table, std::slice::from_ref(&record))
    }

    /// Removes a record identified by its own `id` field.
    ///
    /// # Errors
    ///
    /// Returns an error if the record has no valid id.
    fn delete_record(&self, table: &str, record: &Record) -> StoreResult<()> {
        let id = RecordId::of(record).ok_or_else(|| StoreError::MissingId(table.to_string()))?;
        self.delete(table, &[id])
    }
}

impl<S: LocalStore + ?Sized> LocalStore for Arc<S> {
    fn define_table(&self, definition: &TableDefinition) -> StoreResult<()> {
        (**self).define_table(definition)
    }

    fn upsert(&self, table: &str, records: &[Record]) -> StoreResult<()> {
        (**self).upsert(table, records)
    }

    fn lookup(&self, table: &str, id: &RecordId) -> StoreResult<Option<Record>> {
        (**self).lookup(table, id)
    }

    fn delete(&self, table: &str, ids: &[RecordId]) -> StoreResult<()> {
        (**self).delete(table, ids)
    }

    fn read(&self, query: &Query) -> StoreResult<ReadResult> {
        (**self).read(query)
    }

    fn execute_batch(&self, operations: &[BatchOperation]) -> StoreResult<()> {
        (**self).execute_batch(operations)
    }
}
