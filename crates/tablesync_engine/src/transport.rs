//! Remote table abstraction.

use crate::error::TransportError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tablesync_protocol::{CREATED_AT, UPDATED_AT, VERSION};
use tablesync_store::{evaluate, Query, Record, RecordId, DELETED_FIELD};

/// A remote table service.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (REST client, mock for testing, etc.). Failures are
/// HTTP-shaped: a version mismatch must be reported with status 412 and,
/// when available, the server's current record.
pub trait TableTransport: Send + Sync {
    /// Creates a record and returns the server's representation.
    fn insert(
        &self,
        table: &str,
        record: Record,
    ) -> impl Future<Output = Result<Record, TransportError>> + Send;

    /// Replaces a record and returns the server's representation.
    ///
    /// If `record` carries a `version`, the server rejects the update
    /// with 412 unless it matches its own.
    fn update(
        &self,
        table: &str,
        record: Record,
    ) -> impl Future<Output = Result<Record, TransportError>> + Send;

    /// Deletes a record by id.
    fn delete(
        &self,
        table: &str,
        id: &RecordId,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Runs a query against one table.
    fn read(
        &self,
        query: &Query,
    ) -> impl Future<Output = Result<Vec<Record>, TransportError>> + Send;
}

impl<T: TableTransport> TableTransport for Arc<T> {
    fn insert(
        &self,
        table: &str,
        record: Record,
    ) -> impl Future<Output = Result<Record, TransportError>> + Send {
        (**self).insert(table, record)
    }

    fn update(
        &self,
        table: &str,
        record: Record,
    ) -> impl Future<Output = Result<Record, TransportError>> + Send {
        (**self).update(table, record)
    }

    fn delete(
        &self,
        table: &str,
        id: &RecordId,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).delete(table, id)
    }

    fn read(
        &self,
        query: &Query,
    ) -> impl Future<Output = Result<Vec<Record>, TransportError>> + Send {
        (**self).read(query)
    }
}

/// Kind of a recorded transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCallKind {
    /// `insert`
    Insert,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `read`
    Read,
}

/// One call made against a [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCall {
    /// Which method was called.
    pub kind: TransportCallKind,
    /// Target table.
    pub table: String,
    /// Target record, for writes.
    pub item_id: Option<RecordId>,
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-memory remote table service for testing.
///
/// Behaves like a versioned REST table backend:
/// - every write stamps `updatedAt` from a logical clock and bumps
///   `version`; inserts also stamp `createdAt`
/// - inserting an existing id, or updating with a stale `version`,
///   fails with 412 and the server's record
/// - deletes are soft: the record stays with `deleted: true` and is
///   hidden from reads unless the query includes deleted rows
///
/// Calls are recorded, failures can be injected and an artificial
/// latency lets tests observe overlapping requests.
#[derive(Debug, Default)]
pub struct MockTransport {
    tables: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    clock: AtomicU64,
    failures: Mutex<VecDeque<TransportError>>,
    calls: Mutex<Vec<TransportCall>>,
    latency: Mutex<Option<Duration>>,
    offline: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    /// Creates an empty mock server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    /// Makes the next call fail with `error`. Queued errors are used in
    /// order, one per call.
    pub fn fail_next_with(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    /// Sets the connected state. While disconnected every call fails
    /// with a network error.
    pub fn set_connected(&self, connected: bool) {
        self.offline.store(!connected, Ordering::SeqCst);
    }

    /// Checks if the mock accepts calls.
    pub fn is_connected(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    /// Calls made so far, oldest first.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Returns the server's copy of a record, including soft-deleted ones.
    pub fn server_record(&self, table: &str, id: &RecordId) -> Option<Record> {
        self.tables
            .lock()
            .get(table)
            .and_then(|rows| rows.get(&id.key()))
            .cloned()
    }

    /// Returns every record of a table, including soft-deleted ones.
    pub fn server_records(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stores a record directly, keeping any system properties it
    /// carries and stamping the missing ones.
    ///
    /// Records without a valid id are ignored.
    pub fn seed(&self, table: &str, mut record: Record) -> Record {
        let Some(id) = RecordId::of(&record) else {
            return record;
        };
        let now = Value::from(self.tick());
        record.entry(CREATED_AT).or_insert_with(|| now.clone());
        record.entry(UPDATED_AT).or_insert(now);
        record.entry(VERSION).or_insert_with(|| Value::from(1u64));
        record
            .entry(DELETED_FIELD)
            .or_insert(Value::Bool(false));
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(id.key(), record.clone());
        record
    }

    /// Writes a record as another client would: unconditionally, with a
    /// fresh `updatedAt` and a bumped `version`.
    ///
    /// Records without a valid id are ignored.
    pub fn touch(&self, table: &str, record: Record) -> Record {
        let Some(id) = RecordId::of(&record) else {
            return record;
        };
        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        let stored = self.stamp_write(rows.get(&id.key()), record);
        rows.insert(id.key(), stored.clone());
        stored
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn stamp_write(&self, existing: Option<&Record>, mut record: Record) -> Record {
        let now = Value::from(self.tick());
        let version = existing
            .and_then(|row| row.get(VERSION))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        let created_at = existing
            .and_then(|row| row.get(CREATED_AT))
            .cloned()
            .unwrap_or_else(|| now.clone());

        record.insert(CREATED_AT.into(), created_at);
        record.insert(UPDATED_AT.into(), now);
        record.insert(VERSION.into(), Value::from(version));
        record
            .entry(DELETED_FIELD)
            .or_insert(Value::Bool(false));
        record
    }

    async fn begin(
        &self,
        kind: TransportCallKind,
        table: &str,
        item_id: Option<RecordId>,
    ) -> Result<InFlight<'_>, TransportError> {
        self.calls.lock().push(TransportCall {
            kind,
            table: table.to_string(),
            item_id,
        });
        let call = InFlight::enter(&self.in_flight, &self.max_in_flight);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.is_connected() {
            return Err(TransportError::network("offline"));
        }
        let failure = self.failures.lock().pop_front();
        match failure {
            Some(error) => Err(error),
            None => Ok(call),
        }
    }
}

fn is_deleted(record: &Record) -> bool {
    matches!(record.get(DELETED_FIELD), Some(Value::Bool(true)))
}

fn required_id(record: &Record) -> Result<RecordId, TransportError> {
    RecordId::of(record).ok_or_else(|| TransportError::http(400, "record has no valid id"))
}

impl TableTransport for MockTransport {
    async fn insert(&self, table: &str, record: Record) -> Result<Record, TransportError> {
        let _call = self
            .begin(TransportCallKind::Insert, table, RecordId::of(&record))
            .await?;
        let id = required_id(&record)?;

        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        if let Some(existing) = rows.get(&id.key()) {
            return Err(TransportError::precondition_failed(Some(existing.clone())));
        }
        let stored = self.stamp_write(None, record);
        rows.insert(id.key(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, table: &str, record: Record) -> Result<Record, TransportError> {
        let _call = self
            .begin(TransportCallKind::Update, table, RecordId::of(&record))
            .await?;
        let id = required_id(&record)?;

        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        let existing = match rows.get(&id.key()) {
            Some(existing) if !is_deleted(existing) => existing,
            _ => return Err(TransportError::http(404, format!("{id} not found"))),
        };
        if let Some(version) = record.get(VERSION) {
            if existing.get(VERSION) != Some(version) {
                return Err(TransportError::precondition_failed(Some(existing.clone())));
            }
        }
        let mut record = record;
        record.insert(DELETED_FIELD.into(), Value::Bool(false));
        let stored = self.stamp_write(Some(existing), record);
        rows.insert(id.key(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, table: &str, id: &RecordId) -> Result<(), TransportError> {
        let _call = self
            .begin(TransportCallKind::Delete, table, Some(id.clone()))
            .await?;

        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        let Some(existing) = rows.get(&id.key()) else {
            return Err(TransportError::http(404, format!("{id} not found")));
        };
        if is_deleted(existing) {
            return Ok(());
        }
        let mut tombstone = existing.clone();
        tombstone.insert(DELETED_FIELD.into(), Value::Bool(true));
        let stored = self.stamp_write(Some(existing), tombstone);
        rows.insert(id.key(), stored);
        Ok(())
    }

    async fn read(&self, query: &Query) -> Result<Vec<Record>, TransportError> {
        let _call = self
            .begin(TransportCallKind::Read, &query.table, None)
            .await?;

        let tables = self.tables.lock();
        let Some(rows) = tables.get(&query.table) else {
            return Ok(Vec::new());
        };
        evaluate(query, rows.values())
            .map(|result| result.records)
            .map_err(|e| TransportError::http(400, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn insert_stamps_system_properties() {
        let transport = MockTransport::new();
        let stored = transport
            .insert("todo", record(json!({"id": "a", "text": "milk"})))
            .await
            .unwrap();

        assert_eq!(stored["version"], json!(1));
        assert_eq!(stored["deleted"], json!(false));
        assert!(stored.contains_key("updatedAt"));
        assert!(stored.contains_key("createdAt"));
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_conflict() {
        let transport = MockTransport::new();
        transport.seed("todo", record(json!({"id": "a", "text": "server"})));

        let err = transport
            .insert("todo", record(json!({"id": "A", "text": "client"})))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.server_record.unwrap()["text"], json!("server"));
    }

    #[tokio::test]
    async fn stale_update_is_a_conflict() {
        let transport = MockTransport::new();
        let first = transport.seed("todo", record(json!({"id": "a", "text": "v1"})));
        transport.touch("todo", record(json!({"id": "a", "text": "v2"})));

        let mut stale = first.clone();
        stale.insert("text".into(), json!("mine"));
        let err = transport.update("todo", stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.server_record.unwrap()["version"], json!(2));

        // Without a version the update is unconditional.
        let updated = transport
            .update("todo", record(json!({"id": "a", "text": "forced"})))
            .await
            .unwrap();
        assert_eq!(updated["version"], json!(3));
        assert_eq!(updated["createdAt"], first["createdAt"]);
    }

    #[tokio::test]
    async fn update_of_missing_record_is_not_found() {
        let transport = MockTransport::new();
        let err = transport
            .update("todo", record(json!({"id": "a"})))
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(404));
    }

    #[tokio::test]
    async fn delete_is_soft() {
        let transport = MockTransport::new();
        transport.seed("todo", record(json!({"id": "a"})));
        transport.seed("todo", record(json!({"id": "b"})));
        transport.delete("todo", &"a".into()).await.unwrap();
        transport.delete("todo", &"a".into()).await.unwrap();

        let visible = transport.read(&Query::new("todo")).await.unwrap();
        assert_eq!(visible.len(), 1);

        let all = transport
            .read(&Query::new("todo").include_deleted())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let tombstone = transport.server_record("todo", &"a".into()).unwrap();
        assert_eq!(tombstone["deleted"], json!(true));
        assert_eq!(tombstone["version"], json!(2));
    }

    #[tokio::test]
    async fn injected_failures_are_used_once() {
        let transport = MockTransport::new();
        transport.fail_next_with(TransportError::http(503, "unavailable"));

        let err = transport.read(&Query::new("todo")).await.unwrap_err();
        assert_eq!(err.status, Some(503));
        assert!(transport.read(&Query::new("todo")).await.is_ok());
    }

    #[tokio::test]
    async fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        let err = transport.read(&Query::new("todo")).await.unwrap_err();
        assert_eq!(err.status, None);

        transport.set_connected(true);
        assert!(transport.read(&Query::new("todo")).await.is_ok());
    }

    #[tokio::test]
    async fn calls_are_recorded() {
        let transport = MockTransport::new();
        transport
            .insert("todo", record(json!({"id": "a"})))
            .await
            .unwrap();
        transport.delete("todo", &"a".into()).await.unwrap();

        let kinds: Vec<_> = transport.calls().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![TransportCallKind::Insert, TransportCallKind::Delete]
        );
        assert_eq!(transport.calls()[1].item_id, Some(RecordId::from("a")));
        assert_eq!(transport.max_in_flight(), 1);

        transport.clear_calls();
        assert!(transport.calls().is_empty());
    }
}
