//! # Tablesync Engine
//!
//! Offline-first table sync for tablesync.
//!
//! This crate provides:
//! - A sync context for local inserts, updates and deletes, each logged
//!   atomically with its data change
//! - An operation table manager that condenses repeated changes to a record
//! - A push engine that drains the log oldest-first with a conflict protocol
//! - A pull engine with incremental, checkpointed paging
//! - A FIFO task runner serializing store mutations, pushes and pulls
//! - A remote table abstraction and an in-memory mock remote
//!
//! ## Architecture
//!
//! ```text
//! insert/update/delete ──► store runner ──► [data change + log change] batch
//!
//! push ──► push runner ──► oldest log entry ──► lock ──► remote
//!                                  ▲                      │
//!                                  └── apply + unlock ◄───┘
//!
//! pull ──► pull runner ──► remote page ──► merge (skip pending) + checkpoint batch
//! ```
//!
//! ## Key Invariants
//!
//! - A data change and its log change commit together or not at all
//! - At most one unlocked log entry exists per record
//! - Log entries are pushed in id order; ids never decrease
//! - A pull never overwrites a record with a pending local change
//! - At most one push and one pull run at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod context;
mod error;
mod operations;
mod pull;
mod push;
mod runner;
mod state;
mod transport;

pub use config::{SyncConfig, DEFAULT_MAX_HANDLER_RETRIES, DEFAULT_PULL_PAGE_SIZE};
pub use conflict::PushConflict;
pub use context::SyncContext;
pub use error::{SyncError, SyncResult, TransportError};
pub use operations::OperationTableManager;
pub use pull::PullResult;
pub use push::{NoopHandler, PushHandler, PushResult};
pub use runner::TaskRunner;
pub use state::{PushState, SyncStats};
pub use transport::{MockTransport, TableTransport, TransportCall, TransportCallKind};

pub use tablesync_protocol::{ConflictResolution, OperationAction, OperationLogRecord};
