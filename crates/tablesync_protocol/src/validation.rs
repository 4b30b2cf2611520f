//! Validation of table names, record ids and incremental query ids.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::Value;
use tablesync_store::{Record, RecordId, DELETED_FIELD};

/// Server-maintained creation timestamp.
pub const CREATED_AT: &str = "createdAt";
/// Server-maintained modification timestamp; pull pages are ordered by it.
pub const UPDATED_AT: &str = "updatedAt";
/// Server-maintained record version used for optimistic concurrency.
pub const VERSION: &str = "version";

/// Properties owned by the server and stripped from insert payloads.
pub const SYSTEM_PROPERTIES: [&str; 4] = [CREATED_AT, UPDATED_AT, VERSION, DELETED_FIELD];

/// Prefix reserved for the engine's own tables.
pub const SYSTEM_TABLE_PREFIX: &str = "__";

const MAX_ID_LENGTH: usize = 255;
const FORBIDDEN_ID_CHARS: &[char] = &['"', '+', '?', '\\', '/', '`'];

/// Checks that `name` can be used as a synced table name.
///
/// # Errors
///
/// Fails for blank names and names containing whitespace or control
/// characters.
pub fn validate_table_name(name: &str) -> ProtocolResult<()> {
    if name.trim().is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ProtocolError::InvalidTableName(name.to_string()));
    }
    Ok(())
}

/// Returns true for tables owned by the engine rather than the application.
pub fn is_system_table(name: &str) -> bool {
    name.starts_with(SYSTEM_TABLE_PREFIX)
}

/// Validates a raw id value and converts it into a [`RecordId`].
///
/// Text ids must be non-blank, at most 255 characters, free of control
/// characters and of `" + ? \ / ``, and must not be `.` or `..`.
/// Numeric ids must be positive integers.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidRecordId`] describing the problem.
pub fn validate_record_id(value: &Value) -> ProtocolResult<RecordId> {
    let invalid = |reason: &str| ProtocolError::InvalidRecordId(format!("{value}: {reason}"));

    match value {
        Value::String(text) => {
            if text.trim().is_empty() {
                return Err(invalid("blank"));
            }
            if text.chars().count() > MAX_ID_LENGTH {
                return Err(invalid("longer than 255 characters"));
            }
            if text == "." || text == ".." {
                return Err(invalid("reserved"));
            }
            if text
                .chars()
                .any(|c| c.is_control() || FORBIDDEN_ID_CHARS.contains(&c))
            {
                return Err(invalid("contains a forbidden character"));
            }
            Ok(RecordId::Text(text.clone()))
        }
        Value::Number(number) => match number.as_i64() {
            Some(n) if n > 0 => Ok(RecordId::Number(n)),
            _ => Err(invalid("must be a positive integer")),
        },
        _ => Err(invalid("must be a string or an integer")),
    }
}

/// Validates and returns the id carried by `record`.
///
/// # Errors
///
/// Fails if the record has no `id` or the id is invalid.
pub fn record_id(record: &Record) -> ProtocolResult<RecordId> {
    match record.get(tablesync_store::ID_FIELD) {
        Some(value) => validate_record_id(value),
        None => Err(ProtocolError::InvalidRecordId("missing id".into())),
    }
}

/// Checks an incremental pull query id.
///
/// # Errors
///
/// Query ids must be non-empty and use only ASCII alphanumerics,
/// `-`, `_` and `.`.
pub fn validate_query_id(query_id: &str) -> ProtocolResult<()> {
    let valid = !query_id.is_empty()
        && query_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidQueryId(query_id.to_string()))
    }
}

/// Returns a copy of `record` without the given server-owned properties.
pub fn strip_system_properties(record: &Record, properties: &[String]) -> Record {
    record
        .iter()
        .filter(|(key, _)| !properties.iter().any(|p| p == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
