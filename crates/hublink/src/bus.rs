// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Address-routed publish/subscribe bus.
//!
//! The bus is the only communication path between the multiplexer, the
//! command engine, discovery and the topology manager. Publishing is
//! fire-and-forget and non-blocking; delivery is best-effort,
//! at-most-once. Messages from a single producer reach every matching
//! subscriber in publish order. A subscriber attached after a publish
//! returns never sees that message, and nothing is persisted.

use crate::address::{Address, AddressFilter, EndpointId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One unit of traffic on the bus.
#[derive(Debug, Clone)]
pub struct Message {
    /// Routing key.
    pub address: Address,
    /// Endpoint the message entered the node through, if any.
    ///
    /// Broadcast fan-out skips the originating endpoint so traffic is
    /// only seen by every *other* attached consumer.
    pub origin: Option<EndpointId>,
    /// Opaque payload bytes. Interpreted as UTF-8 text only at the
    /// command-parsing boundary.
    pub payload: Vec<u8>,
}

struct Subscriber {
    id: u64,
    filters: Vec<AddressFilter>,
    tx: mpsc::UnboundedSender<Message>,
}

struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// In-process fan-out channel keyed by [`Address`].
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Mutex<BusInner>>,
}

impl Bus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Attach a subscriber matching any of the given filters.
    pub fn subscribe(&self, filters: Vec<AddressFilter>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, filters, tx });
        Subscription {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Publish a message to every subscriber whose filter matches.
    ///
    /// Never blocks. Subscribers whose receiving side has gone away are
    /// pruned here.
    pub fn publish(&self, address: Address, origin: Option<EndpointId>, payload: Vec<u8>) {
        let message = Message {
            address,
            origin,
            payload,
        };
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|sub| {
            if !sub.filters.iter().any(|f| f.matches(&message.address)) {
                return true;
            }
            sub.tx.send(message.clone()).is_ok()
        });
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn detach(&self, id: u64) {
        self.inner.lock().subscribers.retain(|s| s.id != id);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a bus subscription. Detaches on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
    bus: Bus,
}

impl Subscription {
    /// Wait for the next matching message.
    ///
    /// Returns `None` once the subscription is detached and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.detach(self.id);
    }
}
