// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared connectivity state.
//!
//! [`ConnectivityState`] is the single owner of the primary store's
//! liveness flag. Every probe (periodic or manual) reports through
//! [`ConnectivityState::record_probe`], which swaps the flag atomically and
//! broadcasts a [`ConnectivityEvent`] only when the value actually changed.
//! Because the swap is atomic, each change produces exactly one event no
//! matter how many probes race.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Liveness of the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No probe has completed yet
    Unknown = 0,
    Online = 1,
    Offline = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Online,
            2 => Self::Offline,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Edge-triggered notification of a liveness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityEvent {
    Connected,
    Disconnected,
}

/// Injectable holder for [`ConnectionState`].
pub struct ConnectivityState {
    state: AtomicU8,
    last_check: RwLock<Option<DateTime<Utc>>>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityState {
    const EVENT_CAPACITY: usize = 64;

    #[must_use]
    pub fn new() -> Self {
        Self::with_state(ConnectionState::Unknown)
    }

    #[must_use]
    pub fn with_state(initial: ConnectionState) -> Self {
        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            state: AtomicU8::new(initial as u8),
            last_check: RwLock::new(None),
            events,
        }
    }

    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.get().is_online()
    }

    /// Set to `new` only if the current value is `current`.
    /// Returns the value observed before the attempt.
    pub fn compare_and_swap(
        &self,
        current: ConnectionState,
        new: ConnectionState,
    ) -> Result<ConnectionState, ConnectionState> {
        self.state
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(ConnectionState::from_u8)
            .map_err(ConnectionState::from_u8)
    }

    /// Record a probe outcome. Emits an event when the state flips between
    /// online and offline; the first observation out of `Unknown` is silent.
    pub fn record_probe(&self, online: bool) -> Option<ConnectivityEvent> {
        let new = if online { ConnectionState::Online } else { ConnectionState::Offline };
        *self.last_check.write() = Some(Utc::now());

        let previous = ConnectionState::from_u8(self.state.swap(new as u8, Ordering::AcqRel));
        crate::metrics::set_connection_state(new);

        if previous == new || previous == ConnectionState::Unknown {
            return None;
        }

        let event = if online {
            info!(from = %previous, to = %new, "Primary store reachable again, routing to primary");
            ConnectivityEvent::Connected
        } else {
            warn!(from = %previous, to = %new, "Primary store unreachable, routing to fallback store");
            ConnectivityEvent::Disconnected
        };
        crate::metrics::record_transition(event);

        // No receivers is fine: nobody is subscribed yet.
        let _ = self.events.send(event);
        Some(event)
    }

    #[must_use]
    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.last_check.read()
    }

    /// Subscribe to future transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self::new()
    }
}
