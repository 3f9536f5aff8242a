// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline-db coordinator.
//!
//! [`OfflineDb`] is the composition root. It builds one of each component
//! and wires them together:
//! - [`DatabaseManager`] routing queries between the two stores
//! - [`ConnectivityMonitor`] probing the primary on an interval
//! - [`SyncEngine`] reconciling the stores, triggered by reconnect events
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_db::{OfflineDb, OfflineDbConfig, params};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), offline_db::DbError> {
//! let config = OfflineDbConfig::from_env()?;
//! let db = OfflineDb::from_config(config).await?;
//! db.start().await?;
//!
//! let patients = db
//!     .query("SELECT id, first_name FROM patients WHERE user_id = $1", &params![1_i64])
//!     .await?;
//! println!("{} patients, served by {}", patients.row_count, db.status().backend_name);
//!
//! db.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{HealthReport, LifecycleState};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::OfflineDbConfig;
use crate::error::DbError;
use crate::manager::{DatabaseManager, ManagerStatus};
use crate::monitor::ConnectivityMonitor;
use crate::state::ConnectivityState;
use crate::storage::postgres::PgStore;
use crate::storage::sqlite::{FallbackOptions, FallbackStore};
use crate::storage::Backend;
use crate::sync::{SyncEngine, SyncOutcome, SyncRunRecord};
use crate::value::{QueryResult, SqlValue};

/// Offline-first database handle.
///
/// One per process, created at startup and shared (behind an `Arc` or a
/// static) with request handlers.
pub struct OfflineDb {
    pub(super) config: OfflineDbConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<LifecycleState>,
    pub(super) state_rx: watch::Receiver<LifecycleState>,

    pub(super) manager: Arc<DatabaseManager>,
    pub(super) monitor: Arc<ConnectivityMonitor>,
    pub(super) sync: Arc<SyncEngine>,

    /// Upload-on-reconnect task, present while running
    pub(super) reconnect_listener: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineDb {
    /// Build from configuration with the default table catalog.
    ///
    /// Opens (and bootstraps) the fallback file. The primary pool is lazy:
    /// an unreachable primary does not fail construction.
    pub async fn from_config(config: OfflineDbConfig) -> Result<Self, DbError> {
        let url = config
            .primary_url
            .clone()
            .ok_or_else(|| DbError::Config("primary_url (DATABASE_URL) is required".into()))?;
        let primary = PgStore::connect_lazy(&url, config.primary_max_connections, config.probe_timeout())?;
        Self::with_primary(config, Arc::new(primary), Catalog::default()).await
    }

    /// Build around an already constructed primary store.
    pub async fn with_primary(
        config: OfflineDbConfig,
        primary: Arc<dyn Backend>,
        catalog: Catalog,
    ) -> Result<Self, DbError> {
        let fallback = if config.fallback_enabled {
            let options = FallbackOptions {
                schema: Some(config.fallback_schema()?),
                max_connections: config.fallback_max_connections,
                ..FallbackOptions::for_catalog(&catalog)
            };
            Some(Arc::new(FallbackStore::open_path(&config.fallback_path, options).await?))
        } else {
            info!("Fallback store disabled, all queries go to the primary store");
            None
        };

        let manager = DatabaseManager::new(primary, fallback, Arc::new(ConnectivityState::new()))
            .with_always_use_primary(config.always_use_primary)
            .with_probe_timeout(config.probe_timeout());
        Ok(Self::from_parts(config, Arc::new(manager), catalog))
    }

    /// Assemble from an existing manager.
    pub fn from_parts(config: OfflineDbConfig, manager: Arc<DatabaseManager>, catalog: Catalog) -> Self {
        let (state_tx, state_rx) = watch::channel(LifecycleState::Created);
        let monitor = ConnectivityMonitor::new(Arc::clone(&manager), config.probe_interval())
            .with_status_log_every(config.status_log_every);
        let sync = SyncEngine::new(Arc::clone(&manager), catalog).with_history_cap(config.sync_history_cap);

        Self {
            config,
            state: state_tx,
            state_rx,
            manager,
            monitor: Arc::new(monitor),
            sync: Arc::new(sync),
            reconnect_listener: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<LifecycleState> {
        self.state_rx.clone()
    }

    pub fn config(&self) -> &OfflineDbConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<DatabaseManager> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    /// See [`DatabaseManager::query`].
    pub async fn query(&self, text: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        self.manager.query(text, params).await
    }

    pub fn status(&self) -> ManagerStatus {
        self.manager.status()
    }

    pub async fn sync_to_primary(&self) -> SyncOutcome {
        self.sync.sync_to_primary().await
    }

    pub async fn download_from_primary(&self) -> SyncOutcome {
        self.sync.download_from_primary().await
    }

    pub fn sync_history(&self) -> Vec<SyncRunRecord> {
        self.sync.history()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            lifecycle: self.state(),
            database: self.manager.status(),
            monitor: self.monitor.status(),
            sync: self.sync.status(),
        }
    }
}
