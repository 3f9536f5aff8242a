//! Startup and shutdown sequences.

use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::DbError;
use crate::sync::SyncOutcome;

use super::{LifecycleState, OfflineDb};

impl OfflineDb {
    /// Bring the layer up.
    ///
    /// 1. Probe the primary once to learn the initial state
    /// 2. If online, upload rows left dirty by a previous run
    /// 3. If online, download the primary into the fallback store
    /// 4. Subscribe the upload pass to reconnect events
    /// 5. Start the periodic monitor
    ///
    /// Sync problems are logged and recorded in the sync history; they do
    /// not fail startup. Calling `start()` again is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), DbError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Created {
                *state = LifecycleState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!(state = %self.state(), "Start ignored");
            return Ok(());
        }
        let startup = Instant::now();

        let phase = Instant::now();
        let online = self.manager.check_connectivity().await;
        crate::metrics::record_startup_phase("connectivity", phase.elapsed());
        if online {
            info!("Primary store reachable at startup");
        } else {
            warn!("Primary store unreachable at startup, serving from fallback store");
        }

        if online && self.manager.fallback().is_some() {
            if self.config.upload_on_reconnect {
                let phase = Instant::now();
                log_outcome("startup upload", &self.sync.sync_to_primary().await);
                crate::metrics::record_startup_phase("upload", phase.elapsed());
            }
            if self.config.download_on_startup {
                let phase = Instant::now();
                log_outcome("startup download", &self.sync.download_from_primary().await);
                crate::metrics::record_startup_phase("download", phase.elapsed());
            }
        }

        if self.config.upload_on_reconnect {
            *self.reconnect_listener.lock() = Some(self.sync.spawn_reconnect_listener());
        }

        self.monitor.start().await;

        let _ = self.state.send(LifecycleState::Running);
        crate::metrics::record_startup_phase("total", startup.elapsed());
        info!(online = self.manager.is_online(), "Offline-db started");
        Ok(())
    }

    /// Stop probing, detach the reconnect listener and close both stores.
    /// A sync pass already running is not interrupted.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let claimed = self.state.send_if_modified(|state| {
            if matches!(state, LifecycleState::ShuttingDown | LifecycleState::Stopped) {
                false
            } else {
                *state = LifecycleState::ShuttingDown;
                true
            }
        });
        if !claimed {
            return;
        }
        info!("Shutting down offline-db");

        self.monitor.stop();
        if let Some(listener) = self.reconnect_listener.lock().take() {
            listener.abort();
        }
        self.manager.close().await;

        let _ = self.state.send(LifecycleState::Stopped);
        info!("Offline-db stopped");
    }
}

fn log_outcome(pass: &str, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(run) => info!(pass, synced = run.synced_total(), failed = run.failed_total(), "Sync pass done"),
        SyncOutcome::Failed(run) => warn!(pass, error = run.error.as_deref().unwrap_or_default(), "Sync pass failed"),
        other => debug!(pass, ?other, "Sync pass not run"),
    }
}
