// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation between the fallback and primary stores.
//!
//! # Download (primary → fallback)
//!
//! Every catalog table, in dependency order, is read from the primary in id
//! order and upserted into the fallback store as clean. Local rows that are
//! still dirty are left alone and counted as skipped; they belong to the
//! next upload.
//!
//! # Upload (fallback → primary)
//!
//! Every dirty row, table by table in dependency order, is looked up on the
//! primary by id and then updated or inserted (identifiers are kept). After
//! a successful write the row's dirty bit is cleared, but only if the row
//! still holds the values that were sent.
//!
//! The existence check followed by a separate write is not atomic: a
//! concurrent external writer can insert the same id in between, in which
//! case the INSERT fails and the row stays dirty for the next pass.
//!
//! # Failure isolation
//!
//! A failing row is recorded as a [`RecordFailure`] and the pass moves on.
//! Only a pass-level failure (the primary cannot be reached, a table cannot
//! be read) ends the pass early, and the run is recorded as failed.
//!
//! # Single flight
//!
//! Download and upload share one in-progress flag. A request arriving while
//! a pass is running returns [`SyncOutcome::AlreadyRunning`] immediately
//! and touches nothing. Requests are never queued.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, TableSpec, ID_COLUMN};
use crate::dialect::Statement;
use crate::error::DbError;
use crate::manager::DatabaseManager;
use crate::metrics;
use crate::state::ConnectivityEvent;
use crate::storage::checked_identifier;
use crate::storage::sqlite::FallbackStore;
use crate::value::{Row, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Download,
    Upload,
}

impl SyncDirection {
    pub fn label(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Row counts for one table in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub synced: u64,
    pub failed: u64,
    /// Download only: rows left untouched because they are dirty locally
    pub skipped: u64,
}

impl TableReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }
}

/// One row that could not be synced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub table: String,
    pub id: Value,
    pub error: String,
}

impl RecordFailure {
    fn new(table: &TableSpec, row: &Row, error: &DbError) -> Self {
        Self {
            table: table.name.clone(),
            id: row.get(ID_COLUMN).cloned().unwrap_or(Value::Null),
            error: error.to_string(),
        }
    }
}

/// Summary of one finished pass, kept in the engine's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRunRecord {
    pub run_id: Uuid,
    pub direction: SyncDirection,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Tables processed, in dependency order
    pub tables: Vec<TableReport>,
    pub failures: Vec<RecordFailure>,
    /// False when the pass was aborted before all tables were processed
    pub success: bool,
    pub error: Option<String>,
}

impl SyncRunRecord {
    pub fn synced_total(&self) -> u64 {
        self.tables.iter().map(|t| t.synced).sum()
    }

    pub fn failed_total(&self) -> u64 {
        self.tables.iter().map(|t| t.failed).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }
}

/// Result of a sync request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "run", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every table was processed. Individual rows may still have failed.
    Completed(SyncRunRecord),
    /// The pass was aborted by a pass-level failure.
    Failed(SyncRunRecord),
    /// Another pass holds the single-flight flag; nothing was done.
    AlreadyRunning,
    /// The primary is not reachable; nothing was done.
    Offline,
    /// No fallback store is configured.
    Disabled,
}

impl SyncOutcome {
    pub fn record(&self) -> Option<&SyncRunRecord> {
        match self {
            Self::Completed(run) | Self::Failed(run) => Some(run),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_run: Option<SyncRunRecord>,
    pub total_runs: u64,
}

/// Clears the single-flight flag when the pass ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
        metrics::set_sync_in_progress(false);
    }
}

/// Accumulates one pass before it becomes a [`SyncRunRecord`].
struct RunBuilder {
    direction: SyncDirection,
    started_at: DateTime<Utc>,
    clock: Instant,
    tables: Vec<TableReport>,
    failures: Vec<RecordFailure>,
    error: Option<String>,
}

impl RunBuilder {
    fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            started_at: Utc::now(),
            clock: Instant::now(),
            tables: Vec::new(),
            failures: Vec::new(),
            error: None,
        }
    }

    fn abort(&mut self, context: &str, e: &DbError) {
        error!(direction = %self.direction, error = %e, "{context}");
        self.error = Some(format!("{context}: {e}"));
    }

    fn finish(self) -> SyncRunRecord {
        SyncRunRecord {
            run_id: Uuid::new_v4(),
            direction: self.direction,
            started_at: self.started_at,
            duration_ms: self.clock.elapsed().as_millis() as u64,
            tables: self.tables,
            failures: self.failures,
            success: self.error.is_none(),
            error: self.error,
        }
    }
}

pub struct SyncEngine {
    manager: Arc<DatabaseManager>,
    catalog: Catalog,
    running: AtomicBool,
    history: Mutex<VecDeque<SyncRunRecord>>,
    history_cap: usize,
    total_runs: AtomicU64,
}

impl SyncEngine {
    pub const DEFAULT_HISTORY_CAP: usize = 50;

    pub fn new(manager: Arc<DatabaseManager>, catalog: Catalog) -> Self {
        Self {
            manager,
            catalog,
            running: AtomicBool::new(false),
            history: Mutex::new(VecDeque::new()),
            history_cap: Self::DEFAULT_HISTORY_CAP,
            total_runs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap.max(1);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Finished runs, oldest first.
    pub fn history(&self) -> Vec<SyncRunRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_syncing: self.is_syncing(),
            last_run: self.history.lock().back().cloned(),
            total_runs: self.total_runs.load(Ordering::Relaxed),
        }
    }

    fn try_begin(&self, direction: SyncDirection) -> Option<SyncGuard<'_>> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!(%direction, "Sync already in progress");
            metrics::record_sync_rejected(direction.label());
            return None;
        }
        metrics::set_sync_in_progress(true);
        Some(SyncGuard(&self.running))
    }

    /// Preconditions shared by both passes.
    fn precheck(&self, direction: SyncDirection) -> Result<Arc<FallbackStore>, SyncOutcome> {
        let Some(fallback) = self.manager.fallback().cloned() else {
            debug!(%direction, "No fallback store configured, sync disabled");
            return Err(SyncOutcome::Disabled);
        };
        if !self.manager.is_online() {
            info!(%direction, "Primary store offline, skipping sync");
            return Err(SyncOutcome::Offline);
        }
        Ok(fallback)
    }

    fn complete(&self, run: RunBuilder) -> SyncOutcome {
        let record = run.finish();
        metrics::record_sync_run(
            record.direction.label(),
            record.success,
            std::time::Duration::from_millis(record.duration_ms),
        );

        if record.success {
            info!(
                run_id = %record.run_id,
                direction = %record.direction,
                synced = record.synced_total(),
                failed = record.failed_total(),
                duration_ms = record.duration_ms,
                "Sync pass complete"
            );
        } else {
            warn!(
                run_id = %record.run_id,
                direction = %record.direction,
                synced = record.synced_total(),
                error = record.error.as_deref().unwrap_or_default(),
                "Sync pass aborted"
            );
        }

        {
            let mut history = self.history.lock();
            history.push_back(record.clone());
            while history.len() > self.history_cap {
                history.pop_front();
            }
        }
        self.total_runs.fetch_add(1, Ordering::Relaxed);

        if record.success {
            SyncOutcome::Completed(record)
        } else {
            SyncOutcome::Failed(record)
        }
    }

    /// Mirror every primary row into the fallback store.
    #[tracing::instrument(skip(self))]
    pub async fn download_from_primary(&self) -> SyncOutcome {
        let fallback = match self.precheck(SyncDirection::Download) {
            Ok(fallback) => fallback,
            Err(outcome) => return outcome,
        };
        let Some(_guard) = self.try_begin(SyncDirection::Download) else {
            return SyncOutcome::AlreadyRunning;
        };

        info!(tables = self.catalog.tables().len(), "Starting download from primary");
        let mut run = RunBuilder::new(SyncDirection::Download);

        for table in self.catalog.tables() {
            let rows = match self.fetch_primary_rows(table).await {
                Ok(rows) => rows,
                Err(e) => {
                    run.abort(&format!("Failed to read {} from primary", table.name), &e);
                    break;
                }
            };

            let mut report = TableReport::new(&table.name);
            for row in &rows {
                match fallback.upsert_synced(table, row).await {
                    Ok(true) => report.synced += 1,
                    Ok(false) => {
                        debug!(table = %table.name, id = ?row.get(ID_COLUMN), "Local row is dirty, not overwritten");
                        report.skipped += 1;
                    }
                    Err(e) => {
                        warn!(table = %table.name, id = ?row.get(ID_COLUMN), error = %e, "Failed to download row");
                        report.failed += 1;
                        run.failures.push(RecordFailure::new(table, row, &e));
                    }
                }
            }

            debug!(
                table = %table.name,
                synced = report.synced,
                skipped = report.skipped,
                failed = report.failed,
                "Table downloaded"
            );
            metrics::record_sync_rows("download", &table.name, report.synced, report.failed, report.skipped);
            run.tables.push(report);
        }

        self.complete(run)
    }

    /// Push every dirty fallback row to the primary.
    #[tracing::instrument(skip(self))]
    pub async fn sync_to_primary(&self) -> SyncOutcome {
        let fallback = match self.precheck(SyncDirection::Upload) {
            Ok(fallback) => fallback,
            Err(outcome) => return outcome,
        };
        let Some(_guard) = self.try_begin(SyncDirection::Upload) else {
            return SyncOutcome::AlreadyRunning;
        };

        let mut run = RunBuilder::new(SyncDirection::Upload);
        if let Err(e) = self.manager.probe_primary().await {
            run.abort("Primary store unreachable at upload start", &e);
            return self.complete(run);
        }
        info!("Starting upload to primary");

        for table in self.catalog.tables() {
            let rows = match fallback.dirty_rows(table).await {
                Ok(rows) => rows,
                Err(e) => {
                    run.abort(&format!("Failed to read dirty rows of {}", table.name), &e);
                    break;
                }
            };

            let mut report = TableReport::new(&table.name);
            let mut inserted = false;
            for row in &rows {
                match self.upload_row(&fallback, table, row).await {
                    Ok(was_insert) => {
                        report.synced += 1;
                        inserted |= was_insert;
                    }
                    Err(e) => {
                        warn!(table = %table.name, id = ?row.get(ID_COLUMN), error = %e, "Failed to upload row");
                        report.failed += 1;
                        run.failures.push(RecordFailure::new(table, row, &e));
                    }
                }
            }

            if inserted {
                if let Err(e) = self.manager.primary().realign_identity(&table.name).await {
                    warn!(table = %table.name, error = %e, "Failed to realign identity sequence");
                }
            }
            if let Ok(pending) = fallback.count_dirty(table).await {
                metrics::set_pending_rows(&table.name, pending);
            }

            if !rows.is_empty() {
                debug!(table = %table.name, synced = report.synced, failed = report.failed, "Table uploaded");
            }
            metrics::record_sync_rows("upload", &table.name, report.synced, report.failed, 0);
            run.tables.push(report);
        }

        if run.error.is_none() && run.failures.is_empty() {
            if let Err(e) = fallback.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint fallback store after upload");
            }
        }

        self.complete(run)
    }

    async fn fetch_primary_rows(&self, table: &TableSpec) -> Result<Vec<Row>, DbError> {
        let stmt = Statement::parse(format!(
            "SELECT * FROM {} ORDER BY {ID_COLUMN}",
            checked_identifier(&table.name)?
        ))?;
        Ok(self.manager.primary().query(&stmt, &[]).await?.rows)
    }

    /// Write one dirty row to the primary and clear its dirty bit.
    /// Returns whether the row was inserted (as opposed to updated).
    async fn upload_row(&self, fallback: &FallbackStore, table: &TableSpec, row: &Row) -> Result<bool, DbError> {
        let id = row
            .get(ID_COLUMN)
            .and_then(Value::as_i64)
            .ok_or_else(|| DbError::InvalidValue {
                column: ID_COLUMN.to_string(),
                reason: "missing integer id".to_string(),
            })?;
        let values = table
            .columns
            .iter()
            .map(|c| c.kind.primary_value(&c.name, row.get(&c.name).unwrap_or(&Value::Null)))
            .collect::<Result<Vec<SqlValue>, _>>()?;

        let name = checked_identifier(&table.name)?;
        let primary = self.manager.primary();

        let exists = Statement::parse(format!("SELECT 1 FROM {name} WHERE {ID_COLUMN} = $1"))?;
        let found = primary.query(&exists, &[SqlValue::Int(id)]).await?.row_count > 0;

        let columns: Vec<&str> = table.column_names().collect();
        let (stmt, params) = if found {
            let assignments: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{c} = ${}", i + 1))
                .collect();
            let sql = format!(
                "UPDATE {name} SET {} WHERE {ID_COLUMN} = ${}",
                assignments.join(", "),
                columns.len() + 1
            );
            let mut params = values;
            params.push(SqlValue::Int(id));
            (sql, params)
        } else {
            let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("${i}")).collect();
            let sql = format!(
                "INSERT INTO {name} ({ID_COLUMN}, {}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );
            let mut params = Vec::with_capacity(values.len() + 1);
            params.push(SqlValue::Int(id));
            params.extend(values);
            (sql, params)
        };

        primary.query(&Statement::parse(stmt)?, &params).await?;

        if !fallback.mark_synced(table, row).await? {
            debug!(table = %table.name, id, "Row changed during upload, stays dirty");
        }
        Ok(!found)
    }

    /// Run an upload every time the primary comes back.
    ///
    /// Each upload runs on its own task; a panicking or failing upload
    /// affects neither the listener nor the connectivity monitor.
    pub fn spawn_reconnect_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.manager.state().subscribe();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectivityEvent::Connected) => {
                        info!("Primary store reconnected, uploading local changes");
                        // Own task: aborting the listener must not cut a pass short.
                        let pass = Arc::clone(&engine);
                        match tokio::spawn(async move { pass.sync_to_primary().await }).await {
                            Ok(outcome) => debug!(?outcome, "Reconnect upload finished"),
                            Err(e) => error!(error = %e, "Reconnect upload task failed"),
                        }
                    }
                    Ok(ConnectivityEvent::Disconnected) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Reconnect listener lagged behind connectivity events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
