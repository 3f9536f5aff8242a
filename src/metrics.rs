// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-db.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for installing an exporter
//! (Prometheus, OTEL, etc.). Without one, every call is a no-op.
//!
//! # Metric Naming Convention
//! - `offline_db_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: PostgreSQL, SQLite
//! - `kind`: select, insert, update, delete, other
//! - `direction`: download, upload
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::state::{ConnectionState, ConnectivityEvent};

fn status_label(success: bool) -> &'static str {
    if success { "success" } else { "error" }
}

/// Record a routed query
pub fn record_query(backend: &'static str, kind: &'static str, success: bool) {
    counter!(
        "offline_db_queries_total",
        "backend" => backend,
        "kind" => kind,
        "status" => status_label(success)
    )
    .increment(1);
}

/// Record query latency
pub fn record_query_latency(backend: &'static str, kind: &'static str, duration: Duration) {
    histogram!(
        "offline_db_query_seconds",
        "backend" => backend,
        "kind" => kind
    )
    .record(duration.as_secs_f64());
}

/// A query was served by the fallback store because the primary is down
pub fn record_failover_query(kind: &'static str) {
    counter!("offline_db_failover_queries_total", "kind" => kind).increment(1);
}

/// Primary liveness: 0 = unknown, 1 = online, 2 = offline
pub fn set_connection_state(state: ConnectionState) {
    gauge!("offline_db_connection_state").set(f64::from(state as u8));
}

pub fn record_transition(event: ConnectivityEvent) {
    let to = match event {
        ConnectivityEvent::Connected => "online",
        ConnectivityEvent::Disconnected => "offline",
    };
    counter!("offline_db_connectivity_transitions_total", "to" => to).increment(1);
}

/// Record a connectivity probe and how long it took
pub fn record_probe(success: bool, duration: Duration) {
    counter!("offline_db_probes_total", "status" => status_label(success)).increment(1);
    histogram!("offline_db_probe_seconds").record(duration.as_secs_f64());
}

/// Record a finished sync pass
pub fn record_sync_run(direction: &'static str, success: bool, duration: Duration) {
    counter!(
        "offline_db_sync_runs_total",
        "direction" => direction,
        "status" => status_label(success)
    )
    .increment(1);
    histogram!("offline_db_sync_seconds", "direction" => direction).record(duration.as_secs_f64());
}

/// Per-table row outcomes of a sync pass
pub fn record_sync_rows(direction: &'static str, table: &str, synced: u64, failed: u64, skipped: u64) {
    for (outcome, count) in [("synced", synced), ("failed", failed), ("skipped", skipped)] {
        if count > 0 {
            counter!(
                "offline_db_sync_rows_total",
                "direction" => direction,
                "table" => table.to_string(),
                "outcome" => outcome
            )
            .increment(count);
        }
    }
}

/// A sync request that found another pass already running
pub fn record_sync_rejected(direction: &'static str) {
    counter!("offline_db_sync_rejected_total", "direction" => direction).increment(1);
}

pub fn set_sync_in_progress(in_progress: bool) {
    gauge!("offline_db_sync_in_progress").set(if in_progress { 1.0 } else { 0.0 });
}

/// Rows in the fallback store still waiting for upload
pub fn set_pending_rows(table: &str, count: u64) {
    gauge!("offline_db_pending_rows", "table" => table.to_string()).set(count as f64);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &'static str, duration: Duration) {
    histogram!("offline_db_startup_seconds", "phase" => phase).record(duration.as_secs_f64());
}

/// A timing guard that records query latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    kind: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(backend: &'static str, kind: &'static str) -> Self {
        Self {
            backend,
            kind,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_query_latency(self.backend, self.kind, self.start.elapsed());
    }
}
