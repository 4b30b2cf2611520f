//! Query descriptions and their evaluation over in-memory rows.
//!
//! A [`Query`] is plain data: building and parsing query expressions is
//! left to callers. [`evaluate`] is shared by the in-memory store and by
//! test doubles for remote tables so both sides agree on semantics.

use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Soft-delete flag carried by remote records.
pub const DELETED_FIELD: &str = "deleted";

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
}

/// A single `field op value` predicate. Filters of a query are ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field name.
    pub field: String,
    /// Operator.
    pub op: FilterOp,
    /// Operand.
    pub value: Value,
}

impl Filter {
    /// Returns true if the record satisfies the predicate.
    ///
    /// A missing field is treated as `null`.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.get(&self.field).unwrap_or(&Value::Null);
        let ordering = compare_values(actual, &self.value);
        match self.op {
            FilterOp::Eq => ordering == Ordering::Equal,
            FilterOp::Ne => ordering != Ordering::Equal,
            FilterOp::Gt => ordering == Ordering::Greater,
            FilterOp::Ge => ordering != Ordering::Less,
            FilterOp::Lt => ordering == Ordering::Less,
            FilterOp::Le => ordering != Ordering::Greater,
        }
    }
}

/// One ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field name.
    pub field: String,
    /// Sort descending instead of ascending.
    pub descending: bool,
}

/// A read against a single table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    /// Table to read.
    pub table: String,
    /// Predicates, all of which must hold.
    pub filters: Vec<Filter>,
    /// Ordering keys, most significant first.
    pub order_by: Vec<OrderBy>,
    /// Rows to skip after ordering.
    pub skip: Option<usize>,
    /// Maximum rows to return.
    pub take: Option<usize>,
    /// Projection; `None` returns whole records.
    pub select: Option<Vec<String>>,
    /// Also compute the number of matching rows before paging.
    pub include_total_count: bool,
    /// Return soft-deleted rows too.
    pub include_deleted: bool,
}

impl Query {
    /// Creates a query returning every row of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Adds a predicate.
    pub fn filter(
        mut self,
        field: impl Into<String>,
        op: FilterOp,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Adds an equality predicate.
    pub fn filter_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    /// Adds an ascending ordering key.
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            descending: false,
        });
        self
    }

    /// Adds a descending ordering key.
    pub fn order_by_descending(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            descending: true,
        });
        self
    }

    /// Sets the number of rows to skip.
    pub fn skip(mut self, count: usize) -> Self {
        self.skip = Some(count);
        self
    }

    /// Sets the maximum number of rows.
    pub fn take(mut self, count: usize) -> Self {
        self.take = Some(count);
        self
    }

    /// Restricts the returned fields.
    pub fn select<I, F>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Requests the total count of matching rows.
    pub fn include_total_count(mut self) -> Self {
        self.include_total_count = true;
        self
    }

    /// Includes soft-deleted rows.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadResult {
    /// Matching rows after paging and projection.
    pub records: Vec<Record>,
    /// Matching rows before paging, when requested.
    pub total_count: Option<usize>,
}

/// Orders JSON values: null < bool < number < string < array < object.
///
/// Numbers compare numerically, strings lexicographically. Arrays and
/// objects compare equal to values of their own kind.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn is_soft_deleted(record: &Record) -> bool {
    matches!(record.get(DELETED_FIELD), Some(Value::Bool(true)))
}

/// Evaluates a query over a set of rows belonging to `query.table`.
pub fn evaluate<'a, I>(query: &Query, rows: I) -> StoreResult<ReadResult>
where
    I: IntoIterator<Item = &'a Record>,
{
    if let Some(fields) = &query.select {
        if fields.is_empty() {
            return Err(StoreError::InvalidQuery(
                "select requires at least one field".into(),
            ));
        }
    }

    let mut matched: Vec<&Record> = rows
        .into_iter()
        .filter(|record| query.include_deleted || !is_soft_deleted(record))
        .filter(|record| query.filters.iter().all(|filter| filter.matches(record)))
        .collect();

    if !query.order_by.is_empty() {
        matched.sort_by(|a, b| {
            for key in &query.order_by {
                let left = a.get(&key.field).unwrap_or(&Value::Null);
                let right = b.get(&key.field).unwrap_or(&Value::Null);
                let ordering = compare_values(left, right);
                let ordering = if key.descending {
                    ordering.reverse()
                } else {
                    ordering
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    let total_count = query.include_total_count.then_some(matched.len());
    let records = matched
        .into_iter()
        .skip(query.skip.unwrap_or(0))
        .take(query.take.unwrap_or(usize::MAX))
        .map(|record| project(record, query.select.as_deref()))
        .collect();

    Ok(ReadResult {
        records,
        total_count,
    })
}

fn project(record: &Record, fields: Option<&[String]>) -> Record {
    match fields {
        None => record.clone(),
        Some(fields) => fields
            .iter()
            .filter_map(|field| {
                record
                    .get(field)
                    .map(|value| (field.clone(), value.clone()))
            })
            .collect(),
    }
}
