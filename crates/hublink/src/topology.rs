// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery-driven topology manager.
//!
//! Consumes peer events from the browser and maintains one backend
//! attachment per live peer. An attachment is a pair of TCP links made
//! from the peer's advertised ports: the *publish* link is read-only
//! (peer traffic flows in and is published on the bus tagged with the
//! peer's identity) and the *subscribe* link is write-only (client
//! traffic flows out to the peer). Records without a usable port pair
//! are ignored.
//!
//! Connect attempts run on their own task so an unreachable peer never
//! stalls forwarding to already-attached backends or the handling of
//! later events. A peer exists in the table only after both links are
//! established; a failed connect leaves the peer unknown until it
//! re-announces.

use crate::address::{Address, AddressFilter, EndpointId, PeerId};
use crate::bus::Bus;
use crate::discovery::{PeerEvent, ServiceRecord};
use crate::protocol::FrameBuffer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Outbound TCP connect timeout for a newly discovered peer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on one blocking write to a backend link.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-attachment outbound queue depth.
const LINK_QUEUE: usize = 64;

const READ_BUF: usize = 4096;

struct BackendAttachment {
    /// Distinguishes this attachment from any later one under the same
    /// peer id, so a stale link task can never remove its replacement.
    generation: u64,
    tx: mpsc::Sender<Vec<u8>>,
    /// Close signal for both links. A watch channel stays signalled, so
    /// a link that was mid-write when the signal fired still sees it on
    /// its next poll.
    closed: watch::Sender<()>,
}

type AttachmentTable = Arc<Mutex<HashMap<PeerId, BackendAttachment>>>;

/// Maintains backend attachments in response to discovery events.
pub struct TopologyManager;

impl TopologyManager {
    /// Spawn the topology loop.
    pub fn start(bus: Bus, mut events: mpsc::UnboundedReceiver<PeerEvent>) -> TopologyHandle {
        let shutdown = Arc::new(Notify::new());
        let attachments: AttachmentTable = Arc::new(Mutex::new(HashMap::new()));
        let generations = Arc::new(AtomicU64::new(0));

        let mut sub = bus.subscribe(vec![
            AddressFilter::All,
            AddressFilter::Alarm,
            AddressFilter::AnyPeer,
        ]);
        let attachments_task = attachments.clone();
        let shutdown_task = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(PeerEvent::Appeared(record)) => {
                                tokio::spawn(attach_peer(
                                    bus.clone(),
                                    attachments_task.clone(),
                                    record,
                                    generations.clone(),
                                ));
                            }
                            Some(PeerEvent::Vanished(id)) => {
                                detach_peer(&attachments_task, &id);
                            }
                            None => break,
                        }
                    }
                    msg = sub.recv() => {
                        let Some(msg) = msg else { break };
                        match msg.address {
                            // Only traffic that entered through a client
                            // connection goes out to backends; anything a
                            // backend itself produced must not bounce back.
                            Address::All | Address::Alarm => {
                                if matches!(msg.origin, Some(EndpointId::Connection(_))) {
                                    forward_all(&attachments_task, &msg.payload);
                                }
                            }
                            Address::Peer(id) => {
                                forward_one(&attachments_task, &id, &msg.payload);
                            }
                            Address::Connection(_) => {}
                        }
                    }
                    _ = shutdown_task.notified() => {
                        debug!("Topology manager shutting down");
                        let table = attachments_task.lock();
                        for attachment in table.values() {
                            let _ = attachment.closed.send(());
                        }
                        break;
                    }
                }
            }
        });

        TopologyHandle {
            attachments,
            shutdown,
        }
    }
}

async fn attach_peer(
    bus: Bus,
    attachments: AttachmentTable,
    record: ServiceRecord,
    generations: Arc<AtomicU64>,
) {
    let id = record.instance;

    let (Some(pub_port), Some(sub_port)) = (record.pub_port(), record.sub_port()) else {
        debug!("Peer {} record has no usable port pair, ignoring", id);
        return;
    };

    // A re-announce with a changed record replaces the old attachment.
    detach_peer(&attachments, &id);

    let pub_addr = SocketAddr::new(record.address, pub_port);
    let sub_addr = SocketAddr::new(record.address, sub_port);
    let Some(pub_stream) = connect(&id, pub_addr).await else {
        return;
    };
    let Some(sub_stream) = connect(&id, sub_addr).await else {
        return;
    };
    info!(
        "Attached peer {} ({}) pub {} sub {}",
        id,
        record.device_id().unwrap_or("?"),
        pub_addr,
        sub_addr
    );

    let generation = generations.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel::<Vec<u8>>(LINK_QUEUE);
    let (closed_tx, closed_rx) = watch::channel(());
    let previous = attachments.lock().insert(
        id,
        BackendAttachment {
            generation,
            tx: tx.clone(),
            closed: closed_tx,
        },
    );
    if let Some(previous) = previous {
        // Lost a race against a concurrent attach for the same peer.
        let _ = previous.closed.send(());
    }

    // Handshake so the backend engine announces itself back.
    if let Some(device_id) = record.device_id() {
        let connect = format!("{}\tCONNECT\n", device_id);
        let _ = tx.send(connect.into_bytes()).await;
    }

    let attachments_pub = attachments.clone();
    let closed_pub = closed_rx.clone();
    tokio::spawn(async move {
        run_pub_link(pub_stream, id, bus, closed_pub).await;
        detach_generation(&attachments_pub, &id, generation);
        info!("Detached peer {}", id);
    });

    let attachments_sub = attachments.clone();
    tokio::spawn(async move {
        run_sub_link(sub_stream, id, rx, closed_rx).await;
        detach_generation(&attachments_sub, &id, generation);
    });
}

async fn connect(id: &PeerId, addr: SocketAddr) -> Option<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            warn!("Could not connect to peer {} at {}: {}", id, addr, e);
            None
        }
        Err(_) => {
            warn!("Connect to peer {} at {} timed out", id, addr);
            None
        }
    }
}

fn detach_peer(attachments: &AttachmentTable, id: &PeerId) {
    if let Some(attachment) = attachments.lock().remove(id) {
        let _ = attachment.closed.send(());
    }
}

/// Remove an attachment only if it is still the one the caller belongs
/// to; a stale link task finding a newer generation leaves it alone.
fn detach_generation(attachments: &AttachmentTable, id: &PeerId, generation: u64) {
    let mut table = attachments.lock();
    if table.get(id).map_or(false, |a| a.generation == generation) {
        if let Some(attachment) = table.remove(id) {
            let _ = attachment.closed.send(());
        }
    }
}

fn forward_all(attachments: &AttachmentTable, payload: &[u8]) {
    let table = attachments.lock();
    for (id, attachment) in table.iter() {
        if attachment.tx.try_send(payload.to_vec()).is_err() {
            warn!("Backend attachment {} not keeping up, frame dropped", id);
        }
    }
}

fn forward_one(attachments: &AttachmentTable, id: &PeerId, payload: &[u8]) {
    let table = attachments.lock();
    match table.get(id) {
        Some(attachment) => {
            if attachment.tx.try_send(payload.to_vec()).is_err() {
                warn!("Backend attachment {} not keeping up, frame dropped", id);
            }
        }
        None => debug!("Frame for unknown peer {} dropped", id),
    }
}

/// Read-only side of an attachment: whole lines the peer publishes go
/// onto the bus tagged with the peer's identity.
async fn run_pub_link(
    mut stream: TcpStream,
    id: PeerId,
    bus: Bus,
    mut closed: watch::Receiver<()>,
) {
    let mut buf = vec![0u8; READ_BUF];
    let mut frames = FrameBuffer::new();
    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(frame) = frames.push(&buf[..n]) {
                            bus.publish(
                                Address::All,
                                Some(EndpointId::Peer(id)),
                                frame.into_bytes(),
                            );
                        }
                    }
                    Err(e) => {
                        debug!("Read error on peer {} pub link: {}", id, e);
                        break;
                    }
                }
            }
            _ = closed.changed() => break,
        }
    }
}

/// Write-only side of an attachment: client traffic out to the peer.
async fn run_sub_link(
    mut stream: TcpStream,
    id: PeerId,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    mut closed: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            payload = outbound.recv() => {
                match payload {
                    None => break,
                    Some(payload) => {
                        match tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(&payload)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!("Write error on peer {} sub link: {}", id, e);
                                break;
                            }
                            Err(_) => {
                                warn!("Write to peer {} sub link timed out, detaching", id);
                                break;
                            }
                        }
                    }
                }
            }
            _ = closed.changed() => break,
        }
    }
}

/// Handle to a running topology manager.
pub struct TopologyHandle {
    attachments: AttachmentTable,
    shutdown: Arc<Notify>,
}

impl TopologyHandle {
    /// Number of currently attached peers.
    pub fn peer_count(&self) -> usize {
        self.attachments.lock().len()
    }

    /// Whether a specific peer is attached.
    pub fn is_attached(&self, id: &PeerId) -> bool {
        self.attachments.lock().contains_key(id)
    }

    /// Stop the topology loop and close every backend attachment.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}
