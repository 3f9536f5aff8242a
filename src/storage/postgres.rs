// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! PostgreSQL primary store.
//!
//! The pool is created lazily: building a [`PgStore`] never touches the
//! network, so the process can start (and serve from the fallback store)
//! while the primary is unreachable. The pool's acquire timeout bounds how
//! long any query waits for a dead server.
//!
//! Rows are decoded column by column from the server-reported type into
//! JSON values:
//!
//! | PostgreSQL | JSON |
//! |---|---|
//! | `bool` | boolean |
//! | `int2/int4/int8`, `float4/float8`, `numeric` | number |
//! | `text`, `varchar`, `bpchar`, `name`, `uuid`, `time` | string |
//! | `date` | `"YYYY-MM-DD"` |
//! | `timestamp`, `timestamptz` | RFC 3339, UTC, millisecond precision |
//! | `json`, `jsonb` | structured value |

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgPool, PgPoolOptions, PgRow, PgTypeInfo, Postgres,
};
use sqlx::postgres::types::Oid;
use sqlx::query::Query;
use sqlx::{Column, Encode, Executor, Row as _, Type, TypeInfo};
use std::time::Duration;
use tracing::{debug, error};

use super::checked_identifier;
use super::traits::{Backend, BackendConnection};
use crate::dialect::{Statement, StatementKind};
use crate::error::DbError;
use crate::value::{QueryResult, Row, SqlValue};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a store without connecting. Fails only on a malformed URL.
    pub fn connect_lazy(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy(url)
            .map_err(|e| DbError::Config(format!("invalid primary store URL: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

#[async_trait]
impl Backend for PgStore {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    async fn query(&self, stmt: &Statement, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        run(&self.pool, stmt, params).await
    }

    async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Primary)?;
        Ok(())
    }

    async fn acquire(&self) -> Result<Box<dyn BackendConnection>, DbError> {
        let conn = self.pool.acquire().await.map_err(DbError::Primary)?;
        Ok(Box::new(PgConnectionHandle { conn, in_transaction: false }))
    }

    async fn realign_identity(&self, table: &str) -> Result<(), DbError> {
        let table = checked_identifier(table)?;
        let sql = format!(
            "SELECT setval(pg_get_serial_sequence('{table}', 'id'), GREATEST(COALESCE(MAX(id), 0), 1)) FROM {table}"
        );
        sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Primary)?;
        debug!(table, "Identity sequence realigned");
        Ok(())
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Pooled primary connection.
pub struct PgConnectionHandle {
    conn: PoolConnection<Postgres>,
    in_transaction: bool,
}

#[async_trait]
impl BackendConnection for PgConnectionHandle {
    async fn query(&mut self, stmt: &Statement, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        run(&mut *self.conn, stmt, params).await
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        sqlx::query("BEGIN").execute(&mut *self.conn).await.map_err(DbError::Primary)?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await.map_err(DbError::Primary)?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        let result = sqlx::query("ROLLBACK").execute(&mut *self.conn).await;
        self.in_transaction = false;
        result.map(|_| ()).map_err(DbError::Primary)
    }
}

impl Drop for PgConnectionHandle {
    fn drop(&mut self) {
        if self.in_transaction {
            self.conn.close_on_drop();
        }
    }
}

async fn run<'a, E>(executor: E, stmt: &'a Statement, params: &'a [SqlValue]) -> Result<QueryResult, DbError>
where
    E: Executor<'a, Database = Postgres>,
{
    let query = params.iter().fold(sqlx::query(stmt.text()), bind_value);
    let returns_rows = matches!(stmt.kind(), StatementKind::Select) || stmt.returning().is_some();

    let result = if returns_rows {
        match query.fetch_all(executor).await {
            Ok(rows) => rows
                .iter()
                .map(decode_row)
                .collect::<Result<Vec<_>, _>>()
                .map(QueryResult::from_rows),
            Err(e) => Err(DbError::Primary(e)),
        }
    } else {
        query
            .execute(executor)
            .await
            .map(|done| QueryResult::affected(done.rows_affected()))
            .map_err(DbError::Primary)
    };

    if let Err(ref e) = result {
        error!(query = %stmt.text(), error = %e, "Primary store query failed");
    }
    result
}

/// NULL with no declared type, so the server infers it from context
/// instead of rejecting e.g. a `text` NULL for an integer column.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(UntypedNull),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Date(d) => query.bind(*d),
        SqlValue::Timestamp(ts) => query.bind(*ts),
        SqlValue::Json(v) => query.bind(sqlx::types::Json(v.clone())),
    }
}

fn decode_row(row: &PgRow) -> Result<Row, DbError> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_value(row, idx, column.type_info().name()).map_err(|e| match e {
            DbError::UnsupportedType { type_name, .. } => DbError::UnsupportedType {
                column: column.name().to_string(),
                type_name,
            },
            other => other,
        })?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> Result<Value, DbError> {
    fn get<'r, T>(row: &'r PgRow, idx: usize, map: impl FnOnce(T) -> Value) -> Result<Value, DbError>
    where
        T: sqlx::Decode<'r, Postgres> + Type<Postgres>,
    {
        row.try_get::<Option<T>, _>(idx)
            .map(|v| v.map_or(Value::Null, map))
            .map_err(DbError::Primary)
    }

    match type_name {
        "BOOL" => get::<bool>(row, idx, Value::Bool),
        "INT2" => get::<i16>(row, idx, |v| Value::from(i64::from(v))),
        "INT4" => get::<i32>(row, idx, |v| Value::from(i64::from(v))),
        "INT8" => get::<i64>(row, idx, Value::from),
        "FLOAT4" => get::<f32>(row, idx, |v| Value::from(f64::from(v))),
        "FLOAT8" => get::<f64>(row, idx, Value::from),
        "NUMERIC" => get::<Decimal>(row, idx, |d| {
            let text = d.to_string();
            text.parse::<serde_json::Number>()
                .map(Value::Number)
                .unwrap_or(Value::String(text))
        }),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => get::<String>(row, idx, Value::String),
        "UUID" => get::<uuid::Uuid>(row, idx, |u| Value::String(u.to_string())),
        "DATE" => get::<NaiveDate>(row, idx, |d| Value::String(d.format("%Y-%m-%d").to_string())),
        "TIME" => get::<NaiveTime>(row, idx, |t| Value::String(t.to_string())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, idx, |ts| {
            Value::String(ts.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true))
        }),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, idx, |ts| {
            Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        }),
        "JSON" | "JSONB" => get::<Value>(row, idx, |v| v),
        other => row
            .try_get::<Option<String>, _>(idx)
            .map(|v| v.map_or(Value::Null, Value::String))
            .map_err(|_| DbError::UnsupportedType {
                column: String::new(),
                type_name: other.to_string(),
            }),
    }
}
