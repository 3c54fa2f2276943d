// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry of live client connections on a multiplexed endpoint.

use crate::address::ConnectionId;
use std::collections::HashMap;
use std::time::Instant;

/// Bookkeeping for one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// When the connection was first registered.
    pub connected_at: Instant,
    /// Last inbound activity.
    pub last_seen: Instant,
}

impl ConnectionInfo {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            connected_at: now,
            last_seen: now,
        }
    }
}

/// Live connection identities, exclusively owned and mutated by the
/// multiplexer. Fan-out iterates over [`ConnectionRegistry::list`]
/// snapshots.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionInfo>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identifier if absent. Idempotent; returns `true` if the
    /// identifier was newly added.
    pub fn register(&mut self, id: ConnectionId) -> bool {
        match self.connections.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(ConnectionInfo::new());
                true
            }
        }
    }

    /// Remove an identifier. No-op if absent; returns `true` if removed.
    pub fn unregister(&mut self, id: &ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Whether an identifier is currently live.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Update last-seen for a connection.
    pub fn touch(&mut self, id: &ConnectionId) {
        if let Some(info) = self.connections.get_mut(id) {
            info.last_seen = Instant::now();
        }
    }

    /// Snapshot of currently-live identifiers for fan-out iteration.
    pub fn list(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Info for one connection.
    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.get(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
