// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query routing between the primary and fallback stores.
//!
//! [`DatabaseManager`] is the single entry point for query execution. Every
//! call reads the shared [`ConnectivityState`] and picks a backend:
//!
//! | state | `always_use_primary` | fallback configured | backend |
//! |---|---|---|---|
//! | any | yes | any | primary |
//! | online | no | any | primary |
//! | unknown / offline | no | yes | fallback |
//! | unknown / offline | no | no | primary |
//!
//! A failure on the chosen backend goes back to the caller unchanged. The
//! manager never retries a failed query on the other backend.

use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dialect::Statement;
use crate::error::DbError;
use crate::metrics;
use crate::state::ConnectivityState;
use crate::storage::sqlite::FallbackStore;
use crate::storage::{Backend, BackendConnection};
use crate::value::{QueryResult, SqlValue};

/// Health snapshot for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub is_online: bool,
    /// Backend the next query would be routed to
    pub backend_name: &'static str,
    pub last_check_time: Option<DateTime<Utc>>,
}

pub struct DatabaseManager {
    primary: Arc<dyn Backend>,
    fallback: Option<Arc<FallbackStore>>,
    state: Arc<ConnectivityState>,
    always_use_primary: bool,
    probe_timeout: Duration,
    closed: AtomicBool,
}

impl DatabaseManager {
    pub fn new(
        primary: Arc<dyn Backend>,
        fallback: Option<Arc<FallbackStore>>,
        state: Arc<ConnectivityState>,
    ) -> Self {
        Self {
            primary,
            fallback,
            state,
            always_use_primary: false,
            probe_timeout: Duration::from_secs(5),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_always_use_primary(mut self, always: bool) -> Self {
        self.always_use_primary = always;
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn state(&self) -> &Arc<ConnectivityState> {
        &self.state
    }

    pub fn primary(&self) -> &Arc<dyn Backend> {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&Arc<FallbackStore>> {
        self.fallback.as_ref()
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    /// Live backend, and whether it is the fallback store.
    fn route(&self) -> (&dyn Backend, bool) {
        if self.always_use_primary || self.state.is_online() {
            return (self.primary.as_ref(), false);
        }
        match &self.fallback {
            Some(fallback) => {
                let backend: &dyn Backend = &**fallback;
                (backend, true)
            }
            None => (self.primary.as_ref(), false),
        }
    }

    /// Parse and execute a canonical-dialect query on the live backend.
    pub async fn query(&self, text: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        let stmt = Statement::parse(text)?;
        self.execute(&stmt, params).await
    }

    /// Execute an already classified statement on the live backend.
    pub async fn execute(&self, stmt: &Statement, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        let (backend, failover) = self.route();
        let kind = stmt.kind().label();
        let _timer = metrics::LatencyTimer::new(backend.name(), kind);

        let result = backend.query(stmt, params).await;
        metrics::record_query(backend.name(), kind, result.is_ok());
        if failover {
            metrics::record_failover_query(kind);
        }
        result
    }

    /// Check out a connection from the live backend.
    ///
    /// The connection is released when the returned handle is dropped, on
    /// every exit path.
    pub async fn connect(&self) -> Result<DbConnection, DbError> {
        let (backend, _) = self.route();
        let inner = backend.acquire().await?;
        Ok(DbConnection {
            backend: backend.name(),
            inner,
        })
    }

    /// Run `f` inside a transaction on one connection of the live backend.
    ///
    /// Commits when `f` returns `Ok`. On `Err` the transaction is rolled back
    /// and the callback's error is returned.
    ///
    /// ```rust,no_run
    /// # use offline_db::{DatabaseManager, DbError, params};
    /// # async fn example(db: &DatabaseManager) -> Result<(), DbError> {
    /// let sample_id = db
    ///     .transaction(|conn| {
    ///         Box::pin(async move {
    ///             let created = conn
    ///                 .query("INSERT INTO samples (patient_id) VALUES ($1) RETURNING id", &params![42_i64])
    ///                 .await?;
    ///             conn.query(
    ///                 "UPDATE inventory SET quantity = quantity - 1 WHERE id = $1",
    ///                 &params![3_i64],
    ///             )
    ///             .await?;
    ///             Ok(created.first().and_then(|r| r["id"].as_i64()))
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut DbConnection) -> BoxFuture<'c, Result<T, DbError>> + Send,
    {
        let mut conn = self.connect().await?;
        conn.inner.begin().await?;

        match f(&mut conn).await {
            Ok(value) => {
                conn.inner.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.inner.rollback().await {
                    warn!(
                        backend = conn.backend,
                        error = %rollback_err,
                        "Rollback failed, discarding connection"
                    );
                }
                Err(e)
            }
        }
    }

    /// One bounded round trip to the primary.
    pub async fn probe_primary(&self) -> Result<(), DbError> {
        match timeout(self.probe_timeout, self.primary.ping()).await {
            Ok(result) => result,
            Err(_) => Err(DbError::Timeout(self.probe_timeout)),
        }
    }

    /// Probe the primary out of band and record the result in the shared
    /// state, exactly as a monitor probe would.
    pub async fn check_connectivity(&self) -> bool {
        let start = Instant::now();
        let online = match self.probe_primary().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Primary probe failed");
                false
            }
        };
        metrics::record_probe(online, start.elapsed());
        self.state.record_probe(online);
        online
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            is_online: self.state.is_online(),
            backend_name: self.route().0.name(),
            last_check_time: self.state.last_check(),
        }
    }

    /// Close both stores. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Database manager already closed");
            return;
        }
        if !self.primary.is_closed() {
            self.primary.close().await;
        }
        if let Some(ref fallback) = self.fallback {
            if !fallback.is_closed() {
                fallback.close().await;
            }
        }
        info!("Database manager closed");
    }
}

/// Connection checked out by [`DatabaseManager::connect`].
///
/// Stays bound to the backend that was live when it was acquired, even if
/// connectivity changes while it is held.
pub struct DbConnection {
    backend: &'static str,
    inner: Box<dyn BackendConnection>,
}

impl DbConnection {
    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    pub async fn query(&mut self, text: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        let stmt = Statement::parse(text)?;
        self.execute(&stmt, params).await
    }

    pub async fn execute(&mut self, stmt: &Statement, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        let result = self.inner.query(stmt, params).await;
        metrics::record_query(self.backend, stmt.kind().label(), result.is_ok());
        result
    }
}
