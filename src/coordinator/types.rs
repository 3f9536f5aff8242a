//! Public types for the offline-db coordinator.

use serde::Serialize;

use crate::manager::ManagerStatus;
use crate::monitor::MonitorStatus;
use crate::sync::SyncStatus;

/// Coordinator lifecycle state.
///
/// Use [`super::OfflineDb::state()`] to check the current state or
/// [`super::OfflineDb::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Built, not started
    Created,
    /// First connectivity check and startup download
    Starting,
    /// Monitor running, serving queries
    Running,
    /// Shutdown in progress
    ShuttingDown,
    /// Stores closed
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Combined snapshot for a health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub lifecycle: LifecycleState,
    pub database: ManagerStatus,
    pub monitor: MonitorStatus,
    pub sync: SyncStatus,
}

impl HealthReport {
    /// Serving queries from some store.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.lifecycle == LifecycleState::Running
    }
}
