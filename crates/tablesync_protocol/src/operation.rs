//! Operation log records.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tablesync_store::{ColumnType, Record, RecordId, TableDefinition, ID_FIELD};

/// Column holding the target table of a logged operation.
pub const TABLE_NAME_FIELD: &str = "tableName";
/// Column holding the logged action.
pub const ACTION_FIELD: &str = "action";
/// Column holding the id of the affected record.
pub const ITEM_ID_FIELD: &str = "itemId";

/// Kind of local mutation recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationAction {
    /// Record was created locally.
    Insert,
    /// Record was changed locally.
    Update,
    /// Record was removed locally.
    Delete,
}

impl OperationAction {
    /// Returns the name stored in the log table.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationAction::Insert => "insert",
            OperationAction::Update => "update",
            OperationAction::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationAction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OperationAction::Insert),
            "update" => Ok(OperationAction::Update),
            "delete" => Ok(OperationAction::Delete),
            other => Err(ProtocolError::InvalidAction(other.to_string())),
        }
    }
}

/// One pending mutation in the operation log.
///
/// # Fields
///
/// - `id`: unique, monotonically increasing, never reused
/// - `table_name`: synced table the mutation targets
/// - `action`: insert, update or delete
/// - `item_id`: primary key of the affected record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationLogRecord {
    /// Operation id.
    pub id: u64,
    /// Target table.
    pub table_name: String,
    /// Logged action.
    pub action: OperationAction,
    /// Affected record.
    pub item_id: RecordId,
}

impl OperationLogRecord {
    /// Creates a log record.
    pub fn new(
        id: u64,
        table_name: impl Into<String>,
        action: OperationAction,
        item_id: RecordId,
    ) -> Self {
        Self {
            id,
            table_name: table_name.into(),
            action,
            item_id,
        }
    }

    /// Returns a copy carrying a different action.
    pub fn with_action(&self, action: OperationAction) -> Self {
        Self {
            action,
            ..self.clone()
        }
    }

    /// Primary key of this entry's row in the operation table.
    pub fn row_id(&self) -> RecordId {
        RecordId::Number(i64::try_from(self.id).unwrap_or(i64::MAX))
    }

    /// Returns true if this entry targets the given record.
    pub fn targets(&self, table_name: &str, item_id: &RecordId) -> bool {
        self.table_name == table_name && self.item_id == *item_id
    }

    /// Encodes the entry as a row of the operation table.
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(ID_FIELD.into(), Value::from(self.id));
        record.insert(TABLE_NAME_FIELD.into(), Value::from(self.table_name.clone()));
        record.insert(ACTION_FIELD.into(), Value::from(self.action.as_str()));
        record.insert(ITEM_ID_FIELD.into(), self.item_id.to_value());
        record
    }

    /// Decodes a row of the operation table.
    pub fn from_record(record: &Record) -> ProtocolResult<Self> {
        let malformed = |what: &str| ProtocolError::MalformedLogRecord(what.to_string());

        let id = record
            .get(ID_FIELD)
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("missing id"))?;
        let table_name = record
            .get(TABLE_NAME_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing tableName"))?;
        let action = record
            .get(ACTION_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing action"))?
            .parse()?;
        let item_id = record
            .get(ITEM_ID_FIELD)
            .and_then(RecordId::from_value)
            .ok_or_else(|| malformed("missing itemId"))?;

        Ok(Self {
            id,
            table_name: table_name.to_string(),
            action,
            item_id,
        })
    }
}

/// Schema of the operation table.
pub fn operation_table_definition(name: &str) -> TableDefinition {
    TableDefinition::new(name)
        .column(ID_FIELD, ColumnType::Integer)
        .column(TABLE_NAME_FIELD, ColumnType::String)
        .column(ACTION_FIELD, ColumnType::String)
        .column(ITEM_ID_FIELD, ColumnType::String)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_names() {
        for action in [
            OperationAction::Insert,
            OperationAction::Update,
            OperationAction::Delete,
        ] {
            assert_eq!(action.as_str().parse::<OperationAction>(), Ok(action));
        }
        assert_eq!(
            "upsert".parse::<OperationAction>(),
            Err(ProtocolError::InvalidAction("upsert".into()))
        );
    }

    #[test]
    fn log_record_row_layout() {
        let entry = OperationLogRecord::new(7, "todo", OperationAction::Update, "abc".into());
        let row = entry.to_record();
        assert_eq!(
            serde_json::Value::Object(row.clone()),
            json!({"id": 7, "tableName": "todo", "action": "update", "itemId": "abc"})
        );
        assert_eq!(OperationLogRecord::from_record(&row).unwrap(), entry);
    }

    #[test]
    fn numeric_item_ids_survive_decoding() {
        let row = json!({"id": 1, "tableName": "t", "action": "delete", "itemId": 42});
        let entry = OperationLogRecord::from_record(row.as_object().unwrap()).unwrap();
        assert_eq!(entry.item_id, RecordId::Number(42));
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let row = json!({"id": 1, "tableName": "t", "action": "merge", "itemId": "a"});
        assert!(matches!(
            OperationLogRecord::from_record(row.as_object().unwrap()),
            Err(ProtocolError::InvalidAction(_))
        ));

        let row = json!({"tableName": "t", "action": "insert", "itemId": "a"});
        assert!(matches!(
            OperationLogRecord::from_record(row.as_object().unwrap()),
            Err(ProtocolError::MalformedLogRecord(_))
        ));
    }

    #[test]
    fn targets_matches_case_insensitively() {
        let entry = OperationLogRecord::new(1, "todo", OperationAction::Insert, "ABC".into());
        assert!(entry.targets("todo", &RecordId::from("abc")));
        assert!(!entry.targets("other", &RecordId::from("abc")));
    }

    #[test]
    fn operation_table_schema_is_valid() {
        assert!(operation_table_definition("__operations").validate().is_ok());
    }
}
