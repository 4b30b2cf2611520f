//! Pulling remote changes into the local store.
//!
//! Pages are requested ordered by `updatedAt`, then `id`, with soft
//! deleted rows included so tombstones reach the client. Each page is
//! merged in one batch; a record with a pending local operation is left
//! alone.
//!
//! Incremental pulls keep a checkpoint row in the config table:
//!
//! ```text
//! { "id": "deltaToken|<table>|<query id>",
//!   "checkpoint": { "updatedAt": <watermark>, "seen": [<ids>] } }
//! ```
//!
//! The next page is requested with `updatedAt >= watermark`; rows at
//! exactly the watermark that were already merged are listed in `seen`
//! and dropped, so equal timestamps spanning pages are neither skipped
//! nor fetched forever. The checkpoint is written in the same batch as
//! the page it describes.

use crate::context::StoreHandle;
use crate::error::{SyncError, SyncResult};
use crate::transport::TableTransport;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::ops::AddAssign;
use tablesync_protocol::{
    is_system_table, record_id, validate_query_id, validate_table_name, UPDATED_AT,
};
use tablesync_store::{
    compare_values, BatchOperation, ColumnType, FilterOp, LocalStore, Query, Record, RecordId,
    TableDefinition, DELETED_FIELD, ID_FIELD,
};
use tracing::{debug, info};

const CHECKPOINT_FIELD: &str = "checkpoint";
const SEEN_FIELD: &str = "seen";
const DELTA_TOKEN_PREFIX: &str = "deltaToken";

/// Outcome of a pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullResult {
    /// Records received from the server.
    pub pulled: usize,
    /// Records written locally.
    pub upserted: usize,
    /// Tombstones applied locally.
    pub deleted: usize,
    /// Records left alone because a local change is pending.
    pub skipped_pending: usize,
}

impl AddAssign for PullResult {
    fn add_assign(&mut self, other: Self) {
        self.pulled += other.pulled;
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.skipped_pending += other.skipped_pending;
    }
}

/// Schema of the table holding pull checkpoints.
pub(crate) fn checkpoint_table_definition(name: &str) -> TableDefinition {
    TableDefinition::new(name)
        .column(ID_FIELD, ColumnType::String)
        .column(CHECKPOINT_FIELD, ColumnType::Object)
}

fn checkpoint_key(table: &str, query_id: &str) -> RecordId {
    RecordId::Text(format!("{DELTA_TOKEN_PREFIX}|{table}|{query_id}"))
}

/// Position of an incremental pull.
#[derive(Debug, Clone, PartialEq)]
struct Checkpoint {
    /// Highest `updatedAt` merged so far; `Null` before the first page.
    watermark: Value,
    /// Ids merged at exactly `watermark`.
    seen: Vec<RecordId>,
}

impl Checkpoint {
    fn start() -> Self {
        Self {
            watermark: Value::Null,
            seen: Vec::new(),
        }
    }

    fn from_record(record: &Record) -> Self {
        let Some(checkpoint) = record.get(CHECKPOINT_FIELD).and_then(Value::as_object) else {
            return Self::start();
        };
        Self {
            watermark: checkpoint.get(UPDATED_AT).cloned().unwrap_or(Value::Null),
            seen: checkpoint
                .get(SEEN_FIELD)
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(RecordId::from_value).collect())
                .unwrap_or_default(),
        }
    }

    fn to_record(&self, key: &RecordId) -> Record {
        let seen: Vec<Value> = self.seen.iter().map(RecordId::to_value).collect();
        let mut record = Map::new();
        record.insert(ID_FIELD.into(), key.to_value());
        record.insert(
            CHECKPOINT_FIELD.into(),
            json!({ UPDATED_AT: self.watermark, SEEN_FIELD: seen }),
        );
        record
    }

    /// Returns true if `record` was merged by an earlier page.
    fn has_seen(&self, record: &Record) -> bool {
        let updated_at = record.get(UPDATED_AT).unwrap_or(&Value::Null);
        if compare_values(updated_at, &self.watermark) != Ordering::Equal {
            return false;
        }
        RecordId::of(record).is_some_and(|id| self.seen.contains(&id))
    }

    /// Moves past `record`. Records arrive in ascending `updatedAt` order.
    fn advance(&mut self, record: &Record, id: RecordId) {
        let updated_at = record.get(UPDATED_AT).cloned().unwrap_or(Value::Null);
        if compare_values(&updated_at, &self.watermark) == Ordering::Equal {
            self.seen.push(id);
        } else {
            self.watermark = updated_at;
            self.seen = vec![id];
        }
    }
}

/// Rejects queries whose shape the engine controls itself.
fn validate_pull_query(query: &Query) -> SyncResult<()> {
    validate_table_name(&query.table)?;
    if is_system_table(&query.table) {
        return Err(SyncError::InvalidTableName(query.table.clone()));
    }

    let unsupported = if !query.order_by.is_empty() {
        Some("ordering")
    } else if query.skip.is_some() {
        Some("skip")
    } else if query.take.is_some() {
        Some("take")
    } else if query.select.is_some() {
        Some("select")
    } else if query.include_total_count {
        Some("total count")
    } else {
        None
    };
    match unsupported {
        Some(clause) => Err(SyncError::InvalidQuery(format!(
            "pull queries cannot use {clause}"
        ))),
        None => Ok(()),
    }
}

/// Pages a remote query into the local store.
pub(crate) struct PullEngine<'a, S, T> {
    handle: &'a StoreHandle<S>,
    transport: &'a T,
}

impl<'a, S: LocalStore, T: TableTransport> PullEngine<'a, S, T> {
    pub(crate) fn new(handle: &'a StoreHandle<S>, transport: &'a T) -> Self {
        Self { handle, transport }
    }

    pub(crate) async fn pull(
        &self,
        query: &Query,
        query_id: Option<&str>,
    ) -> SyncResult<PullResult> {
        validate_pull_query(query)?;
        let base = query
            .clone()
            .order_by(UPDATED_AT)
            .order_by(ID_FIELD)
            .include_deleted();

        let result = match query_id {
            Some(query_id) => {
                validate_query_id(query_id)?;
                self.pull_incremental(base, query_id).await?
            }
            None => self.pull_all(base).await?,
        };

        info!(
            table = %query.table,
            query_id = query_id.unwrap_or(""),
            pulled = result.pulled,
            upserted = result.upserted,
            deleted = result.deleted,
            skipped = result.skipped_pending,
            "pull complete"
        );
        Ok(result)
    }

    async fn pull_all(&self, base: Query) -> SyncResult<PullResult> {
        let page_size = self.handle.config.pull_page_size;
        let mut result = PullResult::default();
        let mut offset = 0;

        loop {
            let page = self
                .fetch(&base.clone().skip(offset).take(page_size))
                .await?;
            let fetched = page.len();
            debug!(table = %base.table, offset, fetched, "pulled page");

            result += self.merge_page(&base.table, page, None).await?;
            offset += fetched;
            if fetched < page_size {
                break;
            }
        }
        Ok(result)
    }

    async fn pull_incremental(&self, base: Query, query_id: &str) -> SyncResult<PullResult> {
        let page_size = self.handle.config.pull_page_size;
        let key = checkpoint_key(&base.table, query_id);
        let mut checkpoint = self.load_checkpoint(&key)?;
        let mut result = PullResult::default();

        loop {
            let take = page_size + checkpoint.seen.len();
            let mut page_query = base.clone().take(take);
            if !checkpoint.watermark.is_null() {
                page_query =
                    page_query.filter(UPDATED_AT, FilterOp::Ge, checkpoint.watermark.clone());
            }

            let rows = self.fetch(&page_query).await?;
            let fetched = rows.len();
            let fresh: Vec<Record> = rows
                .into_iter()
                .filter(|row| !checkpoint.has_seen(row))
                .collect();
            debug!(
                table = %base.table,
                query_id,
                watermark = %checkpoint.watermark,
                fetched,
                fresh = fresh.len(),
                "pulled page"
            );
            if fresh.is_empty() {
                break;
            }

            for row in &fresh {
                checkpoint.advance(row, record_id(row)?);
            }
            let save = BatchOperation::upsert(
                &self.handle.config.config_table,
                checkpoint.to_record(&key),
            );
            result += self.merge_page(&base.table, fresh, Some(save)).await?;

            if fetched < take {
                break;
            }
        }
        Ok(result)
    }

    fn load_checkpoint(&self, key: &RecordId) -> SyncResult<Checkpoint> {
        Ok(self
            .handle
            .store
            .lookup(&self.handle.config.config_table, key)?
            .map(|record| Checkpoint::from_record(&record))
            .unwrap_or_else(Checkpoint::start))
    }

    async fn fetch(&self, query: &Query) -> SyncResult<Vec<Record>> {
        self.transport
            .read(query)
            .await
            .map_err(|source| SyncError::Pull {
                table: query.table.clone(),
                source,
            })
    }

    /// Merges one page, plus the checkpoint describing it, in one batch.
    async fn merge_page(
        &self,
        table: &str,
        page: Vec<Record>,
        checkpoint: Option<BatchOperation>,
    ) -> SyncResult<PullResult> {
        self.handle
            .run(|handle| {
                let mut result = PullResult {
                    pulled: page.len(),
                    ..PullResult::default()
                };
                let mut batch = Vec::with_capacity(page.len() + 1);
                let pending = handle.operations.pending_item_keys(table)?;

                for record in page {
                    let id = record_id(&record)?;
                    if pending.contains(&id.key()) {
                        debug!(table, item_id = %id, "local change pending, record not pulled");
                        result.skipped_pending += 1;
                        continue;
                    }
                    if matches!(record.get(DELETED_FIELD), Some(Value::Bool(true))) {
                        batch.push(BatchOperation::delete(table, id));
                        result.deleted += 1;
                    } else {
                        batch.push(BatchOperation::upsert(table, record));
                        result.upserted += 1;
                    }
                }
                batch.extend(checkpoint);

                if !batch.is_empty() {
                    handle.store.execute_batch(&batch)?;
                }
                Ok(result)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, updated_at: u64) -> Record {
        json!({"id": id, "updatedAt": updated_at})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn rejects_engine_controlled_clauses() {
        let base = Query::new("todo");
        assert!(validate_pull_query(&base).is_ok());
        assert!(validate_pull_query(&base.clone().filter_eq("done", false)).is_ok());

        for query in [
            base.clone().order_by("text"),
            base.clone().order_by_descending("text"),
            base.clone().skip(1),
            base.clone().take(1),
            base.clone().select(["text"]),
            base.clone().include_total_count(),
        ] {
            assert!(matches!(
                validate_pull_query(&query),
                Err(SyncError::InvalidQuery(_))
            ));
        }
    }

    #[test]
    fn rejects_system_tables() {
        assert!(matches!(
            validate_pull_query(&Query::new("__operations")),
            Err(SyncError::InvalidTableName(_))
        ));
        assert!(validate_pull_query(&Query::new("")).is_err());
    }

    #[test]
    fn checkpoint_key_format() {
        assert_eq!(
            checkpoint_key("todo", "all"),
            RecordId::Text("deltaToken|todo|all".into())
        );
    }

    #[test]
    fn checkpoint_tracks_rows_at_watermark() {
        let mut checkpoint = Checkpoint::start();
        assert!(!checkpoint.has_seen(&row("a", 1)));

        checkpoint.advance(&row("a", 1), "a".into());
        checkpoint.advance(&row("b", 2), "b".into());
        checkpoint.advance(&row("c", 2), "c".into());
        assert_eq!(checkpoint.watermark, json!(2));
        assert_eq!(checkpoint.seen, vec![RecordId::from("b"), RecordId::from("c")]);

        assert!(checkpoint.has_seen(&row("B", 2)));
        assert!(!checkpoint.has_seen(&row("d", 2)));
        // A seen record changed again is pulled again.
        assert!(!checkpoint.has_seen(&row("b", 3)));
    }

    #[test]
    fn checkpoint_survives_storage() {
        let key = checkpoint_key("todo", "q1");
        let mut checkpoint = Checkpoint::start();
        checkpoint.advance(&row("a", 7), "a".into());
        checkpoint.advance(&row("b", 7), RecordId::Number(3));

        let record = checkpoint.to_record(&key);
        assert_eq!(record.get(ID_FIELD), Some(&json!("deltaToken|todo|q1")));
        assert_eq!(Checkpoint::from_record(&record), checkpoint);
    }

    #[test]
    fn missing_checkpoint_field_restarts() {
        let record = json!({"id": "deltaToken|todo|q1"}).as_object().cloned().unwrap();
        assert_eq!(Checkpoint::from_record(&record), Checkpoint::start());
    }

    #[test]
    fn results_accumulate() {
        let mut total = PullResult::default();
        total += PullResult {
            pulled: 3,
            upserted: 2,
            deleted: 1,
            skipped_pending: 0,
        };
        total += PullResult {
            pulled: 1,
            upserted: 0,
            deleted: 0,
            skipped_pending: 1,
        };
        assert_eq!(
            total,
            PullResult {
                pulled: 4,
                upserted: 2,
                deleted: 1,
                skipped_pending: 1,
            }
        );
    }
}
