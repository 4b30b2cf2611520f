//! Records and record identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A data record: a JSON object with a mandatory `id` field.
pub type Record = serde_json::Map<String, Value>;

/// Name of the primary key field on every record.
pub const ID_FIELD: &str = "id";

/// The primary key of a record.
///
/// Identity is by value within a table. Text ids compare
/// case-insensitively, so `"ABC"` and `"abc"` name the same record.
/// Numeric and text ids never compare equal, even when they render alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Integer id.
    Number(i64),
    /// Text id (including GUIDs).
    Text(String),
}

impl RecordId {
    /// Extracts an id from a JSON value.
    ///
    /// Returns `None` for anything other than a string or an integer.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(RecordId::Text(text.clone())),
            Value::Number(number) => number.as_i64().map(RecordId::Number),
            _ => None,
        }
    }

    /// Extracts the id of a record, if present and well-typed.
    pub fn of(record: &Record) -> Option<Self> {
        record.get(ID_FIELD).and_then(Self::from_value)
    }

    /// Converts the id back into a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            RecordId::Number(number) => Value::from(*number),
            RecordId::Text(text) => Value::String(text.clone()),
        }
    }

    /// Returns the normalized key used for storage lookups.
    pub fn key(&self) -> String {
        match self {
            RecordId::Number(number) => format!("n:{number}"),
            RecordId::Text(text) => format!("s:{}", text.to_lowercase()),
        }
    }

    /// Returns the id as text, if it is a text id.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RecordId::Text(text) => Some(text),
            RecordId::Number(_) => None,
        }
    }
}

impl PartialEq for RecordId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RecordId::Number(a), RecordId::Number(b)) => a == b,
            (RecordId::Text(a), RecordId::Text(b)) => a.to_lowercase() == b.to_lowercase(),
            _ => false,
        }
    }
}

impl Eq for RecordId {}

impl Hash for RecordId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Number(number) => write!(f, "{number}"),
            RecordId::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for RecordId {
    fn from(text: &str) -> Self {
        RecordId::Text(text.to_string())
    }
}

impl From<String> for RecordId {
    fn from(text: String) -> Self {
        RecordId::Text(text)
    }
}

impl From<i64> for RecordId {
    fn from(number: i64) -> Self {
        RecordId::Number(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn text_ids_compare_case_insensitively() {
        assert_eq!(RecordId::from("ABC"), RecordId::from("abc"));
        assert_eq!(RecordId::from("ABC").key(), RecordId::from("abc").key());

        let mut set = HashSet::new();
        set.insert(RecordId::from("Item-1"));
        assert!(set.contains(&RecordId::from("ITEM-1")));
    }

    #[test]
    fn numeric_and_text_ids_differ() {
        assert_ne!(RecordId::from(1), RecordId::from("1"));
        assert_ne!(RecordId::from(1).key(), RecordId::from("1").key());
    }

    #[test]
    fn extracts_id_from_record() {
        let record = json!({"id": "a1", "text": "hello"});
        let record = record.as_object().unwrap();
        assert_eq!(RecordId::of(record), Some(RecordId::from("a1")));

        let numeric = json!({"id": 7});
        assert_eq!(
            RecordId::of(numeric.as_object().unwrap()),
            Some(RecordId::Number(7))
        );

        let missing = json!({"text": "x"});
        assert_eq!(RecordId::of(missing.as_object().unwrap()), None);

        let wrong_type = json!({"id": [1, 2]});
        assert_eq!(RecordId::of(wrong_type.as_object().unwrap()), None);
    }

    #[test]
    fn value_roundtrip_preserves_original_case() {
        let id = RecordId::from("MiXeD");
        assert_eq!(id.to_value(), json!("MiXeD"));
        assert_eq!(id.to_string(), "MiXeD");
    }
}
