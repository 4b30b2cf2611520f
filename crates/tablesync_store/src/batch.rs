//! Batch operations executed atomically by a store.

use crate::record::{Record, RecordId};
use serde::{Deserialize, Serialize};

/// One step of an atomic batch.
///
/// Batches arriving as JSON are tagged by `action`; any action other
/// than `upsert` or `delete` fails to decode, so the batch never runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum BatchOperation {
    /// Insert or replace a record by id.
    Upsert {
        /// Target table.
        #[serde(rename = "tableName")]
        table: String,
        /// Full record to store.
        data: Record,
    },
    /// Remove a record by id. Removing an absent record is not an error.
    Delete {
        /// Target table.
        #[serde(rename = "tableName")]
        table: String,
        /// Id of the record to remove.
        id: RecordId,
    },
}

impl BatchOperation {
    /// Creates an upsert step.
    pub fn upsert(table: impl Into<String>, data: Record) -> Self {
        BatchOperation::Upsert {
            table: table.into(),
            data,
        }
    }

    /// Creates a delete step.
    pub fn delete(table: impl Into<String>, id: RecordId) -> Self {
        BatchOperation::Delete {
            table: table.into(),
            id,
        }
    }

    /// Returns the table this step targets.
    pub fn table(&self) -> &str {
        match self {
            BatchOperation::Upsert { table, .. } | BatchOperation::Delete { table, .. } => table,
        }
    }
}
