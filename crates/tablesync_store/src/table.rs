//! Table definitions.

use crate::error::{StoreError, StoreResult};
use crate::record::ID_FIELD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Column types understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Nested JSON object.
    Object,
    /// JSON array.
    Array,
    /// Signed integer.
    Integer,
    /// Floating point number.
    Real,
    /// Text.
    String,
    /// Boolean.
    Boolean,
    /// Timestamp, stored as text or epoch number.
    Date,
}

impl ColumnType {
    /// Returns true if this type can hold a record id.
    pub fn can_be_id(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::String)
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "object" => Ok(ColumnType::Object),
            "array" => Ok(ColumnType::Array),
            "integer" | "int" => Ok(ColumnType::Integer),
            "real" | "float" => Ok(ColumnType::Real),
            "string" | "text" => Ok(ColumnType::String),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            other => Err(format!("unsupported column type '{other}'")),
        }
    }
}

/// The schema of a table.
///
/// Every table must declare an `id` column of type `String` or `Integer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Table name.
    pub name: String,
    /// Column name to type.
    pub columns: BTreeMap<String, ColumnType>,
}

impl TableDefinition {
    /// Creates an empty definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: BTreeMap::new(),
        }
    }

    /// Adds a column.
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    /// Checks the definition is well-formed.
    pub fn validate(&self) -> StoreResult<()> {
        let invalid = |reason: &str| StoreError::InvalidTableDefinition {
            table: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("table name must not be empty"));
        }
        if self.columns.keys().any(|column| column.trim().is_empty()) {
            return Err(invalid("column names must not be empty"));
        }
        match self.columns.get(ID_FIELD) {
            Some(column_type) if column_type.can_be_id() => Ok(()),
            Some(_) => Err(invalid("id column must be of type string or integer")),
            None => Err(invalid("an id column is required")),
        }
    }

    /// Merges a newer definition into this one.
    ///
    /// New columns are added; existing columns take the newer type.
    /// Columns absent from the newer definition are kept.
    pub fn merge(&mut self, newer: &TableDefinition) {
        for (column, column_type) in &newer.columns {
            self.columns.insert(column.clone(), *column_type);
        }
    }
}
