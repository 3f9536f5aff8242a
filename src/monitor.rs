// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic connectivity probing.
//!
//! The monitor owns no state of its own beyond the probe task: each probe
//! goes through [`DatabaseManager::check_connectivity`], which updates the
//! shared [`crate::ConnectivityState`] and emits transition events. Probe
//! failures only flip the state, they never stop the loop.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::manager::DatabaseManager;
use crate::state::{ConnectionState, ConnectivityEvent};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub state: ConnectionState,
    pub monitoring: bool,
    pub last_check: Option<DateTime<Utc>>,
}

struct ProbeTask {
    shutdown: watch::Sender<bool>,
    // Detached on stop so an in-flight probe finishes.
    _handle: JoinHandle<()>,
}

pub struct ConnectivityMonitor {
    manager: Arc<DatabaseManager>,
    interval: Duration,
    status_log_every: u64,
    probes: AtomicU64,
    running: AtomicBool,
    task: Mutex<Option<ProbeTask>>,
}

impl ConnectivityMonitor {
    pub fn new(manager: Arc<DatabaseManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            status_log_every: 10,
            probes: AtomicU64::new(0),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Log a status line every `n` probes (0 disables it).
    #[must_use]
    pub fn with_status_log_every(mut self, n: u64) -> Self {
        self.status_log_every = n;
        self
    }

    /// Probe once, then keep probing every interval in the background.
    ///
    /// Returns after the first probe completes. A second call while the
    /// monitor is running does nothing.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Connectivity monitor already running");
            return;
        }

        self.probe().await;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately and the start probe covered it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !monitor.running.load(Ordering::Acquire) {
                            break;
                        }
                        monitor.probe().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Connectivity monitor loop exited");
        });

        *self.task.lock() = Some(ProbeTask { shutdown, _handle: handle });
        info!(interval = ?self.interval, "Connectivity monitor started");
    }

    /// One probe, recorded in the shared state. Returns whether the primary
    /// answered.
    pub async fn probe(&self) -> bool {
        let online = self.manager.check_connectivity().await;
        let count = self.probes.fetch_add(1, Ordering::Relaxed) + 1;
        if self.status_log_every > 0 && count % self.status_log_every == 0 {
            info!(
                state = %self.manager.state().get(),
                probes = count,
                "Connectivity status"
            );
        }
        online
    }

    /// Stop scheduling probes. A probe already in flight completes.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            let _ = task.shutdown.send(true);
        }
        info!("Connectivity monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.manager.state();
        MonitorStatus {
            state: state.get(),
            monitoring: self.is_running(),
            last_check: state.last_check(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.manager.state().subscribe()
    }
}
