// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronized tables, in foreign-key dependency order.
//!
//! Every table carries an integer `id` primary key plus the business columns
//! listed here. The fallback copy of each table also has the `synced`
//! column (see [`SYNCED_COLUMN`]).

use crate::error::DbError;
use crate::value::SqlValue;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Fallback-only column: `1` when the row matches the primary, `0` when it
/// was written locally and still has to be uploaded.
pub const SYNCED_COLUMN: &str = "synced";

/// Primary key column shared by all synchronized tables.
pub const ID_COLUMN: &str = "id";

/// Storage type of a business column on the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Boolean,
    Date,
    Timestamp,
    Json,
}

impl ColumnKind {
    /// Convert a value read back from the fallback store into the type the
    /// primary column expects: 0/1 to booleans, text to dates and
    /// timestamps, serialized JSON text back to structured values.
    pub fn primary_value(self, column: &str, value: &Value) -> Result<SqlValue, DbError> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        let invalid = |reason: &str| DbError::InvalidValue {
            column: column.to_string(),
            reason: format!("{reason}: {value}"),
        };

        match self {
            Self::Integer => match value {
                Value::Number(n) => n.as_i64().map(SqlValue::Int).ok_or_else(|| invalid("not an integer")),
                Value::String(s) => s.trim().parse().map(SqlValue::Int).map_err(|_| invalid("not an integer")),
                Value::Bool(b) => Ok(SqlValue::Int(i64::from(*b))),
                _ => Err(invalid("not an integer")),
            },
            Self::Real => match value {
                Value::Number(n) => n.as_f64().map(SqlValue::Float).ok_or_else(|| invalid("not a number")),
                Value::String(s) => s.trim().parse().map(SqlValue::Float).map_err(|_| invalid("not a number")),
                _ => Err(invalid("not a number")),
            },
            Self::Text => match value {
                Value::String(s) => Ok(SqlValue::Text(s.clone())),
                other => Ok(SqlValue::Text(other.to_string())),
            },
            Self::Boolean => match value {
                Value::Bool(b) => Ok(SqlValue::Bool(*b)),
                Value::Number(n) => Ok(SqlValue::Bool(n.as_f64().unwrap_or_default() != 0.0)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "1" | "t" | "true" => Ok(SqlValue::Bool(true)),
                    "0" | "f" | "false" => Ok(SqlValue::Bool(false)),
                    _ => Err(invalid("not a boolean")),
                },
                _ => Err(invalid("not a boolean")),
            },
            Self::Date => match value {
                Value::String(s) => parse_date(s).map(SqlValue::Date).ok_or_else(|| invalid("not a date")),
                _ => Err(invalid("not a date")),
            },
            Self::Timestamp => match value {
                Value::String(s) => parse_timestamp(s)
                    .map(SqlValue::Timestamp)
                    .ok_or_else(|| invalid("not a timestamp")),
                _ => Err(invalid("not a timestamp")),
            },
            Self::Json => match value {
                Value::String(s) if s.starts_with('{') || s.starts_with('[') => Ok(SqlValue::Json(
                    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
                )),
                other => Ok(SqlValue::Json(other.clone())),
            },
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date_naive()))
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

/// One synchronized table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn new(name: &str, columns: &[(&str, ColumnKind)]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(n, k)| ColumnSpec { name: (*n).to_string(), kind: *k })
                .collect(),
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Ordered list of synchronized tables. Order is significant: a table may
/// only reference tables that come before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    tables: Vec<TableSpec>,
}

impl Catalog {
    #[must_use]
    pub fn new(tables: Vec<TableSpec>) -> Self {
        Self { tables }
    }

    #[must_use]
    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        use ColumnKind::*;

        Self::new(vec![
            TableSpec::new("users", &[
                ("first_name", Text),
                ("last_name", Text),
                ("username", Text),
                ("email", Text),
                ("password_hash", Text),
                ("role", Text),
                ("status", Boolean),
                ("created_at", Timestamp),
            ]),
            TableSpec::new("patients", &[
                ("first_name", Text),
                ("last_name", Text),
                ("national_id", Text),
                ("birth_date", Date),
                ("gender", Text),
                ("phone", Text),
                ("address", Text),
                ("user_id", Integer),
                ("created_at", Timestamp),
            ]),
            TableSpec::new("samples", &[
                ("patient_id", Integer),
                ("collected_at", Timestamp),
                ("notes", Text),
                ("paid", Boolean),
                ("result_date", Date),
                ("registered_by", Integer),
                ("created_at", Timestamp),
            ]),
            TableSpec::new("sample_details", &[
                ("sample_id", Integer),
                ("sample_type", Text),
                ("results", Json),
                ("notes", Text),
            ]),
            TableSpec::new("inventory", &[
                ("product_name", Text),
                ("kind", Text),
                ("quantity", Integer),
                ("min_quantity", Integer),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ]),
            TableSpec::new("sample_detail_products", &[
                ("sample_detail_id", Integer),
                ("product_id", Integer),
                ("quantity_used", Integer),
            ]),
            TableSpec::new("reports", &[
                ("user_id", Integer),
                ("start_date", Date),
                ("end_date", Date),
                ("kind", Text),
            ]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_default_catalog_dependency_order() {
        let names: Vec<_> = Catalog::default().names().map(String::from).collect();
        assert_eq!(
            names,
            [
                "users",
                "patients",
                "samples",
                "sample_details",
                "inventory",
                "sample_detail_products",
                "reports"
            ]
        );
    }

    #[test]
    fn test_catalog_lookup_is_case_insensitive() {
        let catalog = Catalog::default();
        assert!(catalog.contains("Patients"));
        assert!(!catalog.contains("audit_log"));
    }

    #[test]
    fn test_boolean_from_sqlite_integer() {
        assert_eq!(ColumnKind::Boolean.primary_value("paid", &json!(1)).unwrap(), SqlValue::Bool(true));
        assert_eq!(ColumnKind::Boolean.primary_value("paid", &json!(0)).unwrap(), SqlValue::Bool(false));
        assert!(ColumnKind::Boolean.primary_value("paid", &json!("maybe")).is_err());
    }

    #[test]
    fn test_json_text_is_reparsed() {
        let v = ColumnKind::Json
            .primary_value("results", &json!(r#"{"glucose": 98}"#))
            .unwrap();
        assert_eq!(v, SqlValue::Json(json!({"glucose": 98})));

        let v = ColumnKind::Json.primary_value("results", &json!("{not json")).unwrap();
        assert_eq!(v, SqlValue::Json(json!("{not json")));
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        for text in ["2024-05-01 08:30:00", "2024-05-01T08:30:00.000Z", "2024-05-01T08:30:00"] {
            assert_eq!(
                ColumnKind::Timestamp.primary_value("created_at", &json!(text)).unwrap(),
                SqlValue::Timestamp(expected),
                "format {text}"
            );
        }
    }

    #[test]
    fn test_date_from_timestamp_text() {
        let d = NaiveDate::from_ymd_opt(2001, 2, 3).unwrap();
        assert_eq!(ColumnKind::Date.primary_value("birth_date", &json!("2001-02-03")).unwrap(), SqlValue::Date(d));
        assert_eq!(
            ColumnKind::Date.primary_value("birth_date", &json!("2001-02-03T00:00:00Z")).unwrap(),
            SqlValue::Date(d)
        );
    }

    #[test]
    fn test_null_passes_for_every_kind() {
        for kind in [ColumnKind::Integer, ColumnKind::Json, ColumnKind::Date, ColumnKind::Boolean] {
            assert_eq!(kind.primary_value("c", &Value::Null).unwrap(), SqlValue::Null);
        }
    }
}
