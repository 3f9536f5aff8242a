// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite fallback store.
//!
//! Accepts canonical (PostgreSQL) statements, translates them with
//! [`crate::dialect::translate`] and shapes results like the primary does:
//!
//! - **SELECT**: rows, row count = number of rows
//! - **INSERT ... RETURNING cols**: the inserted row re-read by its rowid,
//!   restricted to `cols`; row count = affected rows
//! - **INSERT** without RETURNING: one synthetic row `{"id": <rowid>}`
//! - **UPDATE / DELETE**: no rows (RETURNING is not emulated), affected count
//! - anything else: executed for side effect, empty result
//!
//! ## Dirty tracking
//!
//! Rows of tracked tables carry a `synced` column. Local inserts get the
//! column default (`0`, dirty). Caller-issued UPDATEs on a tracked table are
//! rewritten to also set `synced = 0`. The sync engine talks to this store
//! through the dedicated methods at the bottom of this file, which bypass
//! that rewrite.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode,
    SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Executor, Row as _, TypeInfo, ValueRef};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::checked_identifier;
use super::traits::{Backend, BackendConnection};
use crate::catalog::{Catalog, TableSpec, ID_COLUMN, SYNCED_COLUMN};
use crate::dialect::{self, Statement, StatementKind};
use crate::error::DbError;
use crate::resilience::retry::{retry, RetryConfig};
use crate::value::{QueryResult, Row, SqlValue};

/// Built-in bootstrap script for the default [`Catalog`].
pub const DEFAULT_SCHEMA: &str = include_str!("../../schema/fallback.sql");

#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// Script executed once when the store opens.
    pub schema: Option<String>,
    /// Tables whose caller-issued UPDATEs mark rows dirty.
    pub tracked_tables: Vec<String>,
    pub max_connections: u32,
}

impl FallbackOptions {
    #[must_use]
    pub fn for_catalog(catalog: &Catalog) -> Self {
        Self {
            tracked_tables: catalog.names().map(String::from).collect(),
            ..Self::default()
        }
    }

    /// No schema, no dirty tracking: a plain translated SQLite store.
    #[must_use]
    pub fn untracked() -> Self {
        Self {
            schema: None,
            tracked_tables: Vec::new(),
            max_connections: 4,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            schema: Some(DEFAULT_SCHEMA.to_string()),
            tracked_tables: Catalog::default().names().map(String::from).collect(),
            max_connections: 4,
        }
    }
}

pub struct FallbackStore {
    pool: SqlitePool,
    url: String,
    tracked: Arc<HashSet<String>>,
}

impl FallbackStore {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open_path(path: &str, options: FallbackOptions) -> Result<Self, DbError> {
        Self::open(&format!("sqlite://{path}?mode=rwc"), options).await
    }

    /// Private in-memory database, single connection.
    pub async fn in_memory(options: FallbackOptions) -> Result<Self, DbError> {
        Self::open(
            "sqlite::memory:",
            FallbackOptions { max_connections: 1, ..options },
        )
        .await
    }

    pub async fn open(url: &str, options: FallbackOptions) -> Result<Self, DbError> {
        let connect = SqliteConnectOptions::from_str(url)
            .map_err(|e| DbError::Config(format!("invalid fallback store URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let in_memory = url.contains(":memory:");
        let pool = retry("fallback_connect", &RetryConfig::startup(), || {
            let mut pool_options = SqlitePoolOptions::new().max_connections(options.max_connections);
            if in_memory {
                // The database lives and dies with its only connection.
                pool_options = pool_options.min_connections(1).idle_timeout(None).max_lifetime(None);
            }
            let connect = connect.clone();
            async move { pool_options.connect_with(connect).await.map_err(DbError::Fallback) }
        })
        .await?;

        if let Some(ref schema) = options.schema {
            sqlx::raw_sql(schema)
                .execute(&pool)
                .await
                .map_err(DbError::Fallback)?;
            debug!("Fallback schema initialized");
        }

        info!(url, tracked = options.tracked_tables.len(), "Fallback store opened");
        Ok(Self {
            pool,
            url: url.to_string(),
            tracked: Arc::new(
                options
                    .tracked_tables
                    .iter()
                    .map(|t| t.to_ascii_lowercase())
                    .collect(),
            ),
        })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connection(&self) -> Result<PoolConnection<Sqlite>, DbError> {
        self.pool.acquire().await.map_err(DbError::Fallback)
    }
}

#[async_trait]
impl Backend for FallbackStore {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    async fn query(&self, stmt: &Statement, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        let mut conn = self.connection().await?;
        execute_on(&mut conn, stmt, params, &self.tracked).await
    }

    async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Fallback)?;
        Ok(())
    }

    async fn acquire(&self) -> Result<Box<dyn BackendConnection>, DbError> {
        let conn = self.connection().await?;
        Ok(Box::new(SqliteConnectionHandle {
            conn,
            tracked: self.tracked.clone(),
            in_transaction: false,
        }))
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!(url = %self.url, "Fallback store closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Pooled fallback connection. Transactions are plain BEGIN/COMMIT/ROLLBACK
/// statements on this one connection.
pub struct SqliteConnectionHandle {
    conn: PoolConnection<Sqlite>,
    tracked: Arc<HashSet<String>>,
    in_transaction: bool,
}

#[async_trait]
impl BackendConnection for SqliteConnectionHandle {
    async fn query(&mut self, stmt: &Statement, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        execute_on(&mut self.conn, stmt, params, &self.tracked).await
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        (&mut *self.conn).execute("BEGIN").await.map_err(DbError::Fallback)?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        (&mut *self.conn).execute("COMMIT").await.map_err(DbError::Fallback)?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        let result = (&mut *self.conn).execute("ROLLBACK").await;
        self.in_transaction = false;
        result.map(|_| ()).map_err(DbError::Fallback)
    }
}

impl Drop for SqliteConnectionHandle {
    fn drop(&mut self) {
        if self.in_transaction {
            self.conn.close_on_drop();
        }
    }
}

async fn execute_on(
    conn: &mut SqliteConnection,
    stmt: &Statement,
    params: &[SqlValue],
    tracked: &HashSet<String>,
) -> Result<QueryResult, DbError> {
    let result = execute_translated(conn, stmt, params, tracked).await;
    if let Err(ref e) = result {
        error!(
            query = %stmt.text(),
            params = ?params,
            error = %e,
            "Fallback store query failed"
        );
    }
    result
}

async fn execute_translated(
    conn: &mut SqliteConnection,
    stmt: &Statement,
    params: &[SqlValue],
    tracked: &HashSet<String>,
) -> Result<QueryResult, DbError> {
    let mut sql = dialect::translate(stmt.text())?;
    if let StatementKind::Update { table } = stmt.kind() {
        if tracked.contains(&table.to_ascii_lowercase()) {
            sql = dialect::with_assignment(&sql, SYNCED_COLUMN);
        }
    }
    let params: Vec<SqlValue> = params.iter().map(SqlValue::for_fallback).collect();

    match stmt.kind() {
        StatementKind::Select => {
            let rows = bind_all(sqlx::query(&sql), &params)
                .fetch_all(&mut *conn)
                .await
                .map_err(DbError::Fallback)?;
            Ok(QueryResult::from_rows(decode_rows(&rows)?))
        }
        StatementKind::Insert { table } => {
            let done = bind_all(sqlx::query(&sql), &params)
                .execute(&mut *conn)
                .await
                .map_err(DbError::Fallback)?;
            // ON CONFLICT DO NOTHING leaves last_insert_rowid pointing at an older row.
            if done.rows_affected() == 0 {
                return Ok(QueryResult::default());
            }
            let rowid = done.last_insert_rowid();

            match stmt.returning() {
                Some(columns) => {
                    let follow_up = format!(
                        "SELECT {columns} FROM {} WHERE {ID_COLUMN} = ?1",
                        checked_identifier(table)?
                    );
                    let rows = sqlx::query(&follow_up)
                        .bind(rowid)
                        .fetch_all(&mut *conn)
                        .await
                        .map_err(DbError::Fallback)?;
                    Ok(QueryResult {
                        rows: decode_rows(&rows)?,
                        row_count: done.rows_affected(),
                    })
                }
                None => {
                    let mut row = Row::new();
                    row.insert(ID_COLUMN.to_string(), Value::from(rowid));
                    Ok(QueryResult { rows: vec![row], row_count: done.rows_affected() })
                }
            }
        }
        StatementKind::Update { .. } | StatementKind::Delete { .. } => {
            let done = bind_all(sqlx::query(&sql), &params)
                .execute(&mut *conn)
                .await
                .map_err(DbError::Fallback)?;
            Ok(QueryResult::affected(done.rows_affected()))
        }
        StatementKind::Other => {
            if params.is_empty() {
                (&mut *conn).execute(sql.as_str()).await.map_err(DbError::Fallback)?;
            } else {
                bind_all(sqlx::query(&sql), &params)
                    .execute(&mut *conn)
                    .await
                    .map_err(DbError::Fallback)?;
            }
            Ok(QueryResult::default())
        }
    }
}

fn bind_all<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    params.iter().fold(query, |q, value| match value.for_fallback() {
        SqlValue::Null => q.bind(None::<i64>),
        SqlValue::Int(i) => q.bind(i),
        SqlValue::Float(f) => q.bind(f),
        SqlValue::Text(s) => q.bind(s),
        // for_fallback() leaves only the variants above
        other => q.bind(format!("{other:?}")),
    })
}

fn decode_rows(rows: &[SqliteRow]) -> Result<Vec<Row>, DbError> {
    rows.iter().map(decode_row).collect()
}

/// Decode by the stored value's runtime class, not the declared column type.
fn decode_row(row: &SqliteRow) -> Result<Row, DbError> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx).map_err(DbError::Fallback)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let class = raw.type_info().name().to_string();
            match class.as_str() {
                "INTEGER" => Value::from(row.try_get_unchecked::<i64, _>(idx).map_err(DbError::Fallback)?),
                "REAL" => Value::from(row.try_get_unchecked::<f64, _>(idx).map_err(DbError::Fallback)?),
                "TEXT" => Value::String(row.try_get_unchecked::<String, _>(idx).map_err(DbError::Fallback)?),
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx).map_err(DbError::Fallback)?;
                    match String::from_utf8(bytes) {
                        Ok(text) => Value::String(text),
                        Err(e) => Value::from(e.into_bytes()),
                    }
                }
                other => {
                    return Err(DbError::UnsupportedType {
                        column: column.name().to_string(),
                        type_name: other.to_string(),
                    })
                }
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

// Sync engine access. These statements are issued in SQLite dialect and do
// not go through dirty tracking.
impl FallbackStore {
    /// Rows of `table` written locally and not yet uploaded, in id order.
    pub async fn dirty_rows(&self, table: &TableSpec) -> Result<Vec<Row>, DbError> {
        let sql = format!(
            "SELECT * FROM {} WHERE {SYNCED_COLUMN} = 0 ORDER BY {ID_COLUMN}",
            checked_identifier(&table.name)?
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Fallback)?;
        decode_rows(&rows)
    }

    pub async fn count_dirty(&self, table: &TableSpec) -> Result<u64, DbError> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE {SYNCED_COLUMN} = 0",
            checked_identifier(&table.name)?
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Fallback)?;
        let count: i64 = row.try_get("cnt").map_err(DbError::Fallback)?;
        Ok(count as u64)
    }

    /// Fold the SQLite write-ahead log back into the main file.
    ///
    /// A checkpoint blocked by an open reader reports busy instead of
    /// failing; that case is retried a few times before giving up.
    pub async fn checkpoint(&self) -> Result<(), DbError> {
        retry("fallback_checkpoint", &RetryConfig::query(), || async {
            let (busy, log_frames, checkpointed): (i64, i64, i64) =
                sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(DbError::Fallback)?;
            if busy != 0 {
                return Err(DbError::Fallback(sqlx::Error::Protocol(format!(
                    "checkpoint busy ({checkpointed}/{log_frames} frames)"
                ))));
            }
            Ok(())
        })
        .await?;
        debug!(url = %self.url, "Fallback checkpoint completed");
        Ok(())
    }

    /// Materialize a primary row locally as clean (`synced = 1`).
    ///
    /// A local row that is still dirty is left alone so unsent changes are
    /// not overwritten; returns `false` in that case.
    pub async fn upsert_synced(&self, table: &TableSpec, row: &Row) -> Result<bool, DbError> {
        let name = checked_identifier(&table.name)?;
        let columns: Vec<&str> = table
            .column_names()
            .map(checked_identifier)
            .collect::<Result<_, _>>()?;

        let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = columns.iter().map(|c| format!("{c} = excluded.{c}")).collect();
        let sql = format!(
            "INSERT INTO {name} ({ID_COLUMN}, {cols}, {SYNCED_COLUMN}) VALUES ({placeholders}, 1) \
             ON CONFLICT({ID_COLUMN}) DO UPDATE SET {updates}, {SYNCED_COLUMN} = 1 \
             WHERE {name}.{SYNCED_COLUMN} = 1",
            cols = columns.join(", "),
            placeholders = placeholders.join(", "),
            updates = updates.join(", "),
        );

        let id = row.get(ID_COLUMN).cloned().unwrap_or(Value::Null);
        let values: Vec<SqlValue> = std::iter::once(&id)
            .chain(columns.iter().map(|c| row.get(*c).unwrap_or(&Value::Null)))
            .map(SqlValue::from_json)
            .collect();

        let done = bind_all(sqlx::query(&sql), &values)
            .execute(&self.pool)
            .await
            .map_err(DbError::Fallback)?;
        Ok(done.rows_affected() > 0)
    }

    /// Clear the dirty bit of a row that was uploaded as `row`.
    ///
    /// Only clears when the stored row still equals what was uploaded; a
    /// local write that landed in between keeps the row dirty. Returns
    /// whether the bit was cleared.
    pub async fn mark_synced(&self, table: &TableSpec, row: &Row) -> Result<bool, DbError> {
        let name = checked_identifier(&table.name)?;
        let columns: Vec<&str> = table
            .column_names()
            .map(checked_identifier)
            .collect::<Result<_, _>>()?;

        let conditions: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!(" AND {c} IS ?{}", i + 2))
            .collect();
        let sql = format!(
            "UPDATE {name} SET {SYNCED_COLUMN} = 1 WHERE {ID_COLUMN} = ?1 AND {SYNCED_COLUMN} = 0{}",
            conditions.concat()
        );

        let id = row.get(ID_COLUMN).cloned().unwrap_or(Value::Null);
        let values: Vec<SqlValue> = std::iter::once(&id)
            .chain(columns.iter().map(|c| row.get(*c).unwrap_or(&Value::Null)))
            .map(SqlValue::from_json)
            .collect();

        let done = bind_all(sqlx::query(&sql), &values)
            .execute(&self.pool)
            .await
            .map_err(DbError::Fallback)?;
        Ok(done.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;
    use serde_json::json;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, FallbackStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fallback.db");
        let store = FallbackStore::open_path(path.to_str().unwrap(), FallbackOptions::default())
            .await
            .unwrap();
        (dir, store)
    }

    fn stmt(sql: &str) -> Statement {
        Statement::parse(sql).unwrap()
    }

    async fn synced_flag(store: &FallbackStore, table: &str, id: i64) -> i64 {
        let r = store
            .query(&stmt(&format!("SELECT synced FROM {table} WHERE id = $1")), &params![id])
            .await
            .unwrap();
        r.rows[0]["synced"].as_i64().unwrap()
    }

    async fn seed_user(store: &FallbackStore) -> i64 {
        let r = store
            .query(
                &stmt("INSERT INTO users (first_name, username, password_hash) VALUES ($1, $2, $3) RETURNING id"),
                &params!["Ana", "ana", "x"],
            )
            .await
            .unwrap();
        r.rows[0]["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_insert_without_returning_yields_synthetic_id_row() {
        let (_dir, store) = store().await;
        let r = store
            .query(
                &stmt("INSERT INTO inventory (product_name, quantity) VALUES ($1, $2)"),
                &params!["Reagent A", 12_i64],
            )
            .await
            .unwrap();
        assert_eq!(r.row_count, 1);
        assert_eq!(r.rows.len(), 1);
        assert_eq!(r.rows[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_insert_returning_rereads_requested_columns() {
        let (_dir, store) = store().await;
        let r = store
            .query(
                &stmt("INSERT INTO inventory (product_name, quantity, created_at) VALUES ($1, $2, CURRENT_TIMESTAMP) RETURNING id, product_name"),
                &params!["Gloves", 100_i64],
            )
            .await
            .unwrap();
        assert_eq!(r.row_count, 1);
        let row = &r.rows[0];
        assert_eq!(row.len(), 2);
        assert_eq!(row["product_name"], json!("Gloves"));
        assert_eq!(row["id"], json!(1));
    }

    #[tokio::test]
    async fn test_local_insert_is_dirty() {
        let (_dir, store) = store().await;
        let id = seed_user(&store).await;
        assert_eq!(synced_flag(&store, "users", id).await, 0);
    }

    #[tokio::test]
    async fn test_select_returns_rows_and_count() {
        let (_dir, store) = store().await;
        seed_user(&store).await;
        let r = store
            .query(&stmt("SELECT id, first_name FROM users WHERE username = $1"), &params!["ana"])
            .await
            .unwrap();
        assert_eq!(r.row_count, 1);
        assert_eq!(r.rows[0]["first_name"], json!("Ana"));
    }

    #[tokio::test]
    async fn test_update_marks_clean_row_dirty_and_ignores_returning() {
        let (_dir, store) = store().await;
        let catalog = Catalog::default();
        let users = catalog.get("users").unwrap();

        let mut row = Row::new();
        row.insert("id".into(), json!(7));
        row.insert("first_name".into(), json!("Luis"));
        row.insert("username".into(), json!("luis"));
        row.insert("password_hash".into(), json!("h"));
        row.insert("role".into(), json!("admin"));
        row.insert("status".into(), json!(true));
        assert!(store.upsert_synced(users, &row).await.unwrap());
        assert_eq!(synced_flag(&store, "users", 7).await, 1);

        let r = store
            .query(
                &stmt("UPDATE users SET email = $1 WHERE id = $2 RETURNING *"),
                &params!["luis@lab.test", 7_i64],
            )
            .await
            .unwrap();
        assert_eq!(r.row_count, 1);
        assert!(r.rows.is_empty());
        assert_eq!(synced_flag(&store, "users", 7).await, 0);
    }

    #[tokio::test]
    async fn test_booleans_and_dates_normalized_on_bind() {
        let (_dir, store) = store().await;
        let user = seed_user(&store).await;
        let birth = chrono::NaiveDate::from_ymd_opt(1985, 7, 14).unwrap();
        store
            .query(
                &stmt("INSERT INTO patients (first_name, birth_date, user_id) VALUES ($1, $2, $3)"),
                &params!["Rosa", birth, user],
            )
            .await
            .unwrap();
        store
            .query(
                &stmt("INSERT INTO samples (patient_id, paid) VALUES ($1, $2)"),
                &params![1_i64, true],
            )
            .await
            .unwrap();

        let r = store
            .query(&stmt("SELECT p.birth_date, s.paid FROM patients p JOIN samples s ON s.patient_id = p.id"), &[])
            .await
            .unwrap();
        assert_eq!(r.rows[0]["birth_date"], json!("1985-07-14"));
        assert_eq!(r.rows[0]["paid"], json!(1));
    }

    #[tokio::test]
    async fn test_delete_and_ddl() {
        let (_dir, store) = store().await;
        let r = store
            .query(&stmt("CREATE TABLE scratch (id SERIAL PRIMARY KEY, label TEXT)"), &[])
            .await
            .unwrap();
        assert_eq!(r, QueryResult::default());

        store.query(&stmt("INSERT INTO scratch (label) VALUES ($1)"), &params!["a"]).await.unwrap();
        store.query(&stmt("INSERT INTO scratch (label) VALUES ($1)"), &params!["b"]).await.unwrap();
        let r = store
            .query(&stmt("DELETE FROM scratch WHERE label = $1 RETURNING id"), &params!["a"])
            .await
            .unwrap();
        assert_eq!(r.row_count, 1);
        assert!(r.rows.is_empty());
    }

    #[tokio::test]
    async fn test_insert_on_conflict_noop_returns_no_rows() {
        let (_dir, store) = store().await;
        store
            .query(&stmt("CREATE TABLE tags (id SERIAL PRIMARY KEY, label TEXT UNIQUE)"), &[])
            .await
            .unwrap();
        store.query(&stmt("INSERT INTO tags (label) VALUES ($1)"), &params!["a"]).await.unwrap();
        store.query(&stmt("INSERT INTO tags (label) VALUES ($1)"), &params!["b"]).await.unwrap();

        let r = store
            .query(
                &stmt("INSERT INTO tags (label) VALUES ($1) ON CONFLICT DO NOTHING RETURNING id"),
                &params!["a"],
            )
            .await
            .unwrap();
        assert_eq!(r.row_count, 0);
        assert!(r.rows.is_empty());

        let r = store
            .query(&stmt("INSERT INTO tags (label) VALUES ($1) ON CONFLICT DO NOTHING"), &params!["b"])
            .await
            .unwrap();
        assert_eq!(r, QueryResult::default());
    }

    #[tokio::test]
    async fn test_returning_keyword_inside_literal_is_data() {
        let (_dir, store) = store().await;
        store
            .query(&stmt("CREATE TABLE notes (id SERIAL PRIMARY KEY, body TEXT)"), &[])
            .await
            .unwrap();
        let r = store
            .query(
                &stmt("INSERT INTO notes (body) VALUES ('returning patient') RETURNING id, body"),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(r.rows[0]["body"], json!("returning patient"));
        assert_eq!(r.rows[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_connection_transaction_commit_and_rollback() {
        let (_dir, store) = store().await;
        store
            .query(&stmt("CREATE TABLE ledger (id SERIAL PRIMARY KEY, amount INTEGER)"), &[])
            .await
            .unwrap();

        let mut conn = store.acquire().await.unwrap();
        conn.begin().await.unwrap();
        conn.query(&stmt("INSERT INTO ledger (amount) VALUES ($1)"), &params![5_i64]).await.unwrap();
        conn.rollback().await.unwrap();

        conn.begin().await.unwrap();
        conn.query(&stmt("INSERT INTO ledger (amount) VALUES ($1)"), &params![9_i64]).await.unwrap();
        conn.commit().await.unwrap();
        drop(conn);

        let r = store.query(&stmt("SELECT amount FROM ledger"), &[]).await.unwrap();
        assert_eq!(r.row_count, 1);
        assert_eq!(r.rows[0]["amount"], json!(9));
    }

    #[tokio::test]
    async fn test_query_error_propagates() {
        let (_dir, store) = store().await;
        let err = store
            .query(&stmt("SELECT * FROM no_such_table"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Fallback(_)));
    }

    #[tokio::test]
    async fn test_download_upsert_skips_dirty_rows() {
        let (_dir, store) = store().await;
        let catalog = Catalog::default();
        let users = catalog.get("users").unwrap();
        let id = seed_user(&store).await;

        let mut incoming = Row::new();
        incoming.insert("id".into(), json!(id));
        incoming.insert("first_name".into(), json!("Server copy"));
        incoming.insert("username".into(), json!("ana"));
        incoming.insert("password_hash".into(), json!("x"));
        incoming.insert("role".into(), json!("user"));
        incoming.insert("status".into(), json!(true));

        assert!(!store.upsert_synced(users, &incoming).await.unwrap());
        let r = store
            .query(&stmt("SELECT first_name, synced FROM users WHERE id = $1"), &params![id])
            .await
            .unwrap();
        assert_eq!(r.rows[0]["first_name"], json!("Ana"));
        assert_eq!(r.rows[0]["synced"], json!(0));
    }

    #[tokio::test]
    async fn test_mark_synced_only_when_unchanged() {
        let (_dir, store) = store().await;
        let catalog = Catalog::default();
        let users = catalog.get("users").unwrap();
        seed_user(&store).await;

        let read = store.dirty_rows(users).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(store.count_dirty(users).await.unwrap(), 1);

        // A local edit lands after the upload read the row
        store
            .query(&stmt("UPDATE users SET email = $1 WHERE id = $2"), &params!["new@lab.test", 1_i64])
            .await
            .unwrap();
        assert!(!store.mark_synced(users, &read[0]).await.unwrap());
        assert_eq!(store.count_dirty(users).await.unwrap(), 1);

        let reread = store.dirty_rows(users).await.unwrap();
        assert!(store.mark_synced(users, &reread[0]).await.unwrap());
        assert_eq!(store.count_dirty(users).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connection_transaction_rollback() {
        let (_dir, store) = store().await;
        let mut conn = store.acquire().await.unwrap();
        conn.begin().await.unwrap();
        conn.query(
            &stmt("INSERT INTO inventory (product_name) VALUES ($1)"),
            &params!["Swabs"],
        )
        .await
        .unwrap();
        conn.rollback().await.unwrap();
        drop(conn);

        let r = store.query(&stmt("SELECT * FROM inventory"), &[]).await.unwrap();
        assert_eq!(r.row_count, 0);
    }

    #[tokio::test]
    async fn test_in_memory_store_keeps_data() {
        let store = FallbackStore::in_memory(FallbackOptions::default()).await.unwrap();
        seed_user(&store).await;
        let r = store.query(&stmt("SELECT COUNT(*) AS n FROM users"), &[]).await.unwrap();
        assert_eq!(r.rows[0]["n"], json!(1));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_dir, store) = store().await;
        store.close().await;
        store.close().await;
        assert!(store.is_closed());
    }
}
