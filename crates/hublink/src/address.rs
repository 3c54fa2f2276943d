// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routing identities and address classes for the message bus.
//!
//! Connection and peer identifiers are UUIDs, while `ALL` and `ALARM`
//! are dedicated enum variants, so the four address classes can never
//! collide in value space.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier for one live client connection on a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier for one discovered peer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a fresh peer identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// The endpoint a message entered the node through.
///
/// Fan-out loops use this to avoid echoing traffic back to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointId {
    /// A client connection on the local multiplexer.
    Connection(ConnectionId),
    /// A bridged backend peer.
    Peer(PeerId),
}

/// Routing key for bus messages.
///
/// Exactly one class matches per outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Every live client connection.
    All,
    /// The out-of-band alert channel.
    Alarm,
    /// Unicast to one client connection.
    Connection(ConnectionId),
    /// Traffic (and discovery control) for one backend peer.
    Peer(PeerId),
}

/// Subscriber-side match on the address namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFilter {
    /// Match `Address::All`.
    All,
    /// Match `Address::Alarm`.
    Alarm,
    /// Match one specific connection address.
    Connection(ConnectionId),
    /// Match any connection address.
    AnyConnection,
    /// Match one specific peer address.
    Peer(PeerId),
    /// Match any peer address.
    AnyPeer,
}

impl AddressFilter {
    /// Check whether an address matches this filter.
    pub fn matches(&self, address: &Address) -> bool {
        match (self, address) {
            (Self::All, Address::All) => true,
            (Self::Alarm, Address::Alarm) => true,
            (Self::Connection(id), Address::Connection(other)) => id == other,
            (Self::AnyConnection, Address::Connection(_)) => true,
            (Self::Peer(id), Address::Peer(other)) => id == other,
            (Self::AnyPeer, Address::Peer(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_filter_sentinels() {
        assert!(AddressFilter::All.matches(&Address::All));
        assert!(AddressFilter::Alarm.matches(&Address::Alarm));
        assert!(!AddressFilter::All.matches(&Address::Alarm));
        assert!(!AddressFilter::Alarm.matches(&Address::All));
    }

    #[test]
    fn test_filter_connection_exact() {
        let id = ConnectionId::new();
        let other = ConnectionId::new();
        assert!(AddressFilter::Connection(id).matches(&Address::Connection(id)));
        assert!(!AddressFilter::Connection(id).matches(&Address::Connection(other)));
        assert!(!AddressFilter::Connection(id).matches(&Address::All));
    }

    #[test]
    fn test_filter_any_connection() {
        let id = ConnectionId::new();
        assert!(AddressFilter::AnyConnection.matches(&Address::Connection(id)));
        assert!(!AddressFilter::AnyConnection.matches(&Address::Peer(PeerId::new())));
    }

    #[test]
    fn test_filter_any_peer() {
        let id = PeerId::new();
        assert!(AddressFilter::AnyPeer.matches(&Address::Peer(id)));
        assert!(AddressFilter::Peer(id).matches(&Address::Peer(id)));
        assert!(!AddressFilter::AnyPeer.matches(&Address::Connection(ConnectionId::new())));
    }

    #[test]
    fn test_peer_id_serde_roundtrip() {
        let id = PeerId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
