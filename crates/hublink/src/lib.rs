// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hublink: messaging core for multiplexed IoT device connectivity.
//!
//! The crate is built around an in-process, address-routed bus. TCP
//! multiplexers bring many client connections onto the bus, a command
//! engine resolves the line-oriented control protocol, and a
//! discovery-driven topology manager bridges traffic to backend peers
//! found on the local network.
//!
//! # Components
//!
//! - [`bus`]: publish/subscribe fan-out keyed by [`address::Address`]
//! - [`protocol`]: tab-and-newline command framing
//! - [`device`]: command engine over a registry of [`device::Control`]s
//! - [`registry`]: live connection bookkeeping
//! - [`multiplexer`]: TCP listener in device or bridge mode
//! - [`discovery`]: multicast announce/browse with peer leases
//! - [`topology`]: backend attachments driven by discovery events
//! - [`producer`]: device-side publish/subscribe listener pair and
//!   unsolicited state, popup and alarm pushes

pub mod address;
pub mod bus;
pub mod device;
pub mod discovery;
pub mod multiplexer;
pub mod producer;
pub mod protocol;
pub mod registry;
pub mod topology;

pub use address::{Address, AddressFilter, ConnectionId, EndpointId, PeerId};
pub use bus::{Bus, Message, Subscription};
pub use device::{Control, Device};
pub use discovery::{
    Announcer, Beacon, Browser, BrowserHandle, DiscoveryConfig, PeerEvent, ServiceRecord,
};
pub use multiplexer::{Fanout, MultiplexerHandle, MuxError, TcpMultiplexer};
pub use producer::{ProducerEndpoint, ProducerHandle};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use topology::{TopologyHandle, TopologyManager};
