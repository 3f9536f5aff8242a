// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Parameter and result types shared by both backends.
//!
//! Callers pass positional [`SqlValue`]s and get back a [`QueryResult`]:
//! an ordered list of rows (column name → JSON value) plus a row count.
//! The shape is identical whichever backend served the query.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// One result row, columns in select order.
pub type Row = serde_json::Map<String, Value>;

/// Uniform result of a query on either backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub row_count: u64,
}

impl QueryResult {
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self { rows, row_count }
    }

    #[must_use]
    pub fn affected(row_count: u64) -> Self {
        Self { rows: Vec::new(), row_count }
    }

    /// First row, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// A positional query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

impl SqlValue {
    /// Normalize for the embedded engine: booleans become 0/1, date/time
    /// values become ISO-8601 text, structured values are serialized.
    #[must_use]
    pub fn for_fallback(&self) -> SqlValue {
        match self {
            Self::Bool(b) => Self::Int(i64::from(*b)),
            Self::Date(d) => Self::Text(d.format("%Y-%m-%d").to_string()),
            Self::Timestamp(ts) => Self::Text(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Self::Json(v) => Self::Text(v.to_string()),
            other => other.clone(),
        }
    }

    /// Build a parameter from a JSON value as returned in a [`Row`].
    #[must_use]
    pub fn from_json(value: &Value) -> SqlValue {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Self::Json(value.clone()),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        Self::Timestamp(v.and_utc())
    }
}

impl From<Value> for SqlValue {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build a parameter list from heterogeneous values.
///
/// ```
/// use offline_db::{params, SqlValue};
/// let p = params!["Ada", 42_i64, true];
/// assert_eq!(p[2], SqlValue::Bool(true));
/// ```
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::SqlValue>::new() };
    ($($v:expr),+ $(,)?) => { vec![$($crate::SqlValue::from($v)),+] };
}
