//! Aggregate storage modes.

use serde::{Deserialize, Serialize};

/// Governs which of {append events, write snapshot} a repository performs
/// when saving an aggregate. Fixed per aggregate-collection configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Append events only; no state snapshots.
    Events,
    /// Persist state snapshots only; no event history.
    State,
    /// Append events and persist state snapshots.
    EventsAndState,
}

impl StorageMode {
    pub fn stores_events(self) -> bool {
        !matches!(self, StorageMode::State)
    }

    pub fn stores_state(self) -> bool {
        !matches!(self, StorageMode::Events)
    }
}
