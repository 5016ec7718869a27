//! Shared read view of connection states.
//!
//! Written only by the registry actor; read synchronously by the lock
//! manager when it needs to know whether a holder is still alive.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tabgate_core::{ConnectionId, ConnectionState};

use crate::locks::LivenessProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    epoch: u64,
    state: ConnectionState,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionDirectory {
    entries: Arc<RwLock<HashMap<ConnectionId, Entry>>>,
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, id: &ConnectionId, epoch: u64, state: ConnectionState) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(id.clone(), Entry { epoch, state });
    }

    pub(crate) fn remove(&self, id: &ConnectionId, epoch: u64) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.get(id).is_some_and(|e| e.epoch == epoch) {
            entries.remove(id);
        }
    }

    pub fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .map(|e| e.state)
    }
}

impl LivenessProbe for ConnectionDirectory {
    /// Only OPEN connections count as alive.
    fn is_alive(&self, connection: &ConnectionId) -> bool {
        self.state(connection).is_some_and(|s| s.is_open())
    }
}
