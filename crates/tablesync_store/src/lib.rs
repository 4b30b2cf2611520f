//! # tablesync Store
//!
//! Local store contract and implementations for tablesync.
//!
//! This crate provides the durable table storage the sync engine reads
//! and writes while offline. Stores hold JSON records keyed by `id` and
//! know nothing about operation logs, push, or pull.
//!
//! ## Design Principles
//!
//! - Tables are defined before use; schema evolution only adds columns
//! - `execute_batch` is atomic: all steps succeed or none are visible
//! - Text ids are matched case-insensitively
//! - Must be `Send + Sync` so one handle can be shared by every engine
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral state
//! - [`FileStore`] - JSON snapshot in a locked directory
//!
//! ## Example
//!
//! ```rust
//! use tablesync_store::{BatchOperation, ColumnType, LocalStore, MemoryStore, TableDefinition};
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! store
//!     .define_table(&TableDefinition::new("todo").column("id", ColumnType::String))
//!     .unwrap();
//!
//! let record = json!({"id": "1", "text": "buy milk"}).as_object().cloned().unwrap();
//! store.execute_batch(&[BatchOperation::upsert("todo", record)]).unwrap();
//! assert_eq!(store.row_count("todo"), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod batch;
mod error;
mod file;
mod memory;
mod query;
mod record;
mod table;

pub use backend::LocalStore;
pub use batch::BatchOperation;
pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use query::{
    compare_values, evaluate, Filter, FilterOp, OrderBy, Query, ReadResult, DELETED_FIELD,
};
pub use record::{Record, RecordId, ID_FIELD};
pub use table::{ColumnType, TableDefinition};
