//! Shared helpers for scenario tests.
//!
//! [`FlakyPrimary`] stands in for PostgreSQL: an SQLite store holding the
//! primary-side schema (no `synced` column), whose reachability is toggled
//! at runtime. While unreachable, every call fails the way a dead network
//! peer does.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use offline_db::{
    Backend, BackendConnection, Catalog, DbError, FallbackOptions, FallbackStore, OfflineDb,
    OfflineDbConfig, QueryResult, Row, SqlValue, Statement,
};

/// Primary-side schema for the default catalog.
pub const PRIMARY_SCHEMA: &str = "
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    first_name TEXT NOT NULL, last_name TEXT, username TEXT NOT NULL UNIQUE, email TEXT,
    password_hash TEXT NOT NULL, role TEXT NOT NULL DEFAULT 'user', status BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now'))
);
CREATE TABLE patients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    first_name TEXT NOT NULL, last_name TEXT, national_id TEXT, birth_date TEXT, gender TEXT,
    phone TEXT, address TEXT, user_id INTEGER REFERENCES users(id),
    created_at TEXT DEFAULT (datetime('now'))
);
CREATE TABLE samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id INTEGER NOT NULL REFERENCES patients(id), collected_at TEXT, notes TEXT,
    paid BOOLEAN NOT NULL DEFAULT 0, result_date TEXT, registered_by INTEGER REFERENCES users(id),
    created_at TEXT DEFAULT (datetime('now'))
);
CREATE TABLE sample_details (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sample_id INTEGER NOT NULL REFERENCES samples(id), sample_type TEXT NOT NULL, results TEXT, notes TEXT
);
CREATE TABLE inventory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_name TEXT NOT NULL, kind TEXT, quantity INTEGER NOT NULL DEFAULT 0,
    min_quantity INTEGER NOT NULL DEFAULT 0, created_at TEXT, updated_at TEXT
);
CREATE TABLE sample_detail_products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sample_detail_id INTEGER NOT NULL REFERENCES sample_details(id),
    product_id INTEGER NOT NULL REFERENCES inventory(id), quantity_used INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER REFERENCES users(id), start_date TEXT, end_date TEXT, kind TEXT
);
";

pub struct FlakyPrimary {
    inner: FallbackStore,
    reachable: AtomicBool,
    writes: AtomicU64,
    delay: Mutex<Duration>,
}

impl FlakyPrimary {
    pub async fn new() -> Arc<Self> {
        let inner = FallbackStore::in_memory(FallbackOptions::untracked().with_schema(PRIMARY_SCHEMA))
            .await
            .expect("primary stand-in opens");
        Arc::new(Self {
            inner,
            reachable: AtomicBool::new(true),
            writes: AtomicU64::new(0),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Slow every query down, to hold a sync pass open.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// INSERT/UPDATE/DELETE statements that reached the store.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), DbError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::Primary(sqlx::Error::PoolTimedOut))
        }
    }

    /// Direct access, bypassing reachability.
    pub async fn rows(&self, sql: &str, params: &[SqlValue]) -> Vec<Row> {
        let stmt = Statement::parse(sql).expect("valid statement");
        self.inner.query(&stmt, params).await.expect("primary query").rows
    }
}

#[async_trait]
impl Backend for FlakyPrimary {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    async fn query(&self, stmt: &Statement, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        self.check()?;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if stmt.kind().is_write() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.query(stmt, params).await
    }

    async fn ping(&self) -> Result<(), DbError> {
        self.check()?;
        self.inner.ping().await
    }

    async fn acquire(&self) -> Result<Box<dyn BackendConnection>, DbError> {
        self.check()?;
        self.inner.acquire().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Log to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn unique_fallback_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path()
        .join(format!("{name}_{}.db", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string()
}

/// Coordinator over a flaky primary and a fresh fallback file.
pub async fn offline_db(dir: &tempfile::TempDir, primary: Arc<FlakyPrimary>) -> OfflineDb {
    offline_db_with(dir, primary, |_| {}).await
}

pub async fn offline_db_with(
    dir: &tempfile::TempDir,
    primary: Arc<FlakyPrimary>,
    configure: impl FnOnce(&mut OfflineDbConfig),
) -> OfflineDb {
    let mut config = OfflineDbConfig {
        fallback_path: unique_fallback_path(dir, "fallback"),
        probe_interval_secs: 3600,
        probe_timeout_ms: 500,
        ..Default::default()
    };
    configure(&mut config);
    OfflineDb::with_primary(config, primary, Catalog::default())
        .await
        .expect("offline db builds")
}

/// Poll until `check` holds or the deadline passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
