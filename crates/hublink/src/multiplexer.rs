// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP connection multiplexer.
//!
//! Accepts many raw TCP clients on one listening port and bridges them
//! onto the in-process bus. Two modes share the listener machinery:
//!
//! - **Device mode**: inbound frames are resolved by a local command
//!   engine and the reply is unicast back to the sending connection.
//! - **Bridge mode**: inbound frames are published for the topology
//!   manager to forward to backend peers; the engine is not involved.
//!
//! In both modes the multiplexer fans `ALL` and `ALARM` bus traffic out
//! to every live client, excluding clients of this multiplexer when the
//! message originated from one of them.

use crate::address::{Address, AddressFilter, ConnectionId, EndpointId};
use crate::bus::{Bus, Message};
use crate::device::Device;
use crate::protocol::FrameBuffer;
use crate::registry::ConnectionRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Per-connection outbound queue depth. A client that stays this far
/// behind is evicted rather than allowed to stall the fan-out loop.
const OUTBOUND_QUEUE: usize = 64;

/// Inbound read buffer size.
const READ_BUF: usize = 4096;

/// Upper bound on one blocking write to a client. A client that stops
/// reading gets its socket closed instead of wedging its task.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Multiplexer error types.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("bind error: {0}")]
    Bind(String),
    #[error("multiplexer already running")]
    AlreadyRunning,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What happens to frames read from a client.
#[derive(Clone)]
pub enum MuxMode {
    /// Resolve frames against a local command engine and unicast the
    /// reply back to the sender.
    Device(Arc<Device>),
    /// Publish frames for the topology manager to forward to backends.
    Bridge,
}

/// Outbound delivery to live client connections.
///
/// Owns the connection registry and one bounded sender per client.
/// Kept separate from the listener so delivery and eviction rules are
/// testable without sockets.
pub struct Fanout {
    registry: ConnectionRegistry,
    senders: HashMap<ConnectionId, mpsc::Sender<Vec<u8>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            senders: HashMap::new(),
        }
    }

    /// Register a connection and its outbound queue.
    pub fn attach(&mut self, id: ConnectionId, tx: mpsc::Sender<Vec<u8>>) {
        self.registry.register(id);
        self.senders.insert(id, tx);
    }

    /// Remove a connection. No-op if absent.
    pub fn detach(&mut self, id: &ConnectionId) {
        self.registry.unregister(id);
        self.senders.remove(id);
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Deliver one bus message to its recipients. Returns the ids of
    /// connections evicted because their queue was closed or full.
    ///
    /// `ALL` and `ALARM` messages that entered the node through one of
    /// this multiplexer's own connections are not delivered at all:
    /// local clients never see their own or their siblings' traffic
    /// reflected back.
    pub fn deliver(&mut self, message: &Message) -> Vec<ConnectionId> {
        let recipients: Vec<ConnectionId> = match message.address {
            Address::Connection(id) => {
                if self.registry.contains(&id) {
                    vec![id]
                } else {
                    // Unicast for a connection that has already gone.
                    return Vec::new();
                }
            }
            Address::All | Address::Alarm => {
                if let Some(EndpointId::Connection(origin)) = message.origin {
                    if self.registry.contains(&origin) {
                        return Vec::new();
                    }
                }
                self.registry.list()
            }
            Address::Peer(_) => return Vec::new(),
        };

        let mut evicted = Vec::new();
        for id in recipients {
            let sent = self
                .senders
                .get(&id)
                .map(|tx| tx.try_send(message.payload.clone()).is_ok())
                .unwrap_or(false);
            if !sent {
                self.detach(&id);
                evicted.push(id);
            }
        }
        evicted
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

/// Listening endpoint multiplexing many TCP clients onto the bus.
pub struct TcpMultiplexer {
    bind_address: String,
    port: u16,
    mode: MuxMode,
    bus: Bus,
}

impl TcpMultiplexer {
    /// Create a multiplexer serving a local command engine.
    pub fn device(bind_address: &str, port: u16, device: Arc<Device>, bus: Bus) -> Self {
        Self {
            bind_address: bind_address.to_string(),
            port,
            mode: MuxMode::Device(device),
            bus,
        }
    }

    /// Create a multiplexer feeding the topology manager.
    pub fn bridge(bind_address: &str, port: u16, bus: Bus) -> Self {
        Self {
            bind_address: bind_address.to_string(),
            port,
            mode: MuxMode::Bridge,
            bus,
        }
    }

    /// Bind the listener and spawn the accept and fan-out loops.
    pub async fn start(self) -> Result<MultiplexerHandle, MuxError> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| MuxError::Bind(format!("{}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        info!("Multiplexer listening on {}", local_addr);

        let shutdown = Arc::new(Notify::new());
        let running = Arc::new(AtomicBool::new(true));
        let fanout = Arc::new(Mutex::new(Fanout::new()));

        // Fan-out loop: bus traffic towards clients.
        let mut sub = self.bus.subscribe(vec![
            AddressFilter::All,
            AddressFilter::Alarm,
            AddressFilter::AnyConnection,
        ]);
        let fanout_deliver = fanout.clone();
        let shutdown_deliver = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = sub.recv() => {
                        match msg {
                            Some(msg) => {
                                let evicted = fanout_deliver.lock().deliver(&msg);
                                for id in evicted {
                                    warn!("Evicted slow or closed connection {}", id);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_deliver.notified() => {
                        debug!("Fan-out loop shutting down");
                        break;
                    }
                }
            }
        });

        // Accept loop.
        let bus = self.bus.clone();
        let mode = self.mode.clone();
        let fanout_accept = fanout.clone();
        let shutdown_accept = shutdown.clone();
        let running_accept = running.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let id = ConnectionId::new();
                                info!("New connection {} from {}", id, peer_addr);

                                let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
                                fanout_accept.lock().attach(id, tx);

                                let bus = bus.clone();
                                let mode = mode.clone();
                                let fanout = fanout_accept.clone();
                                let shutdown = shutdown_accept.clone();
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        handle_connection(stream, id, rx, mode, &bus, shutdown)
                                            .await
                                    {
                                        warn!("Connection {} error: {}", id, e);
                                    }
                                    fanout.lock().detach(&id);
                                    info!("Connection {} closed", id);
                                });
                            }
                            Err(e) => {
                                warn!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_accept.notified() => {
                        debug!("Accept loop shutting down");
                        break;
                    }
                }
            }
            running_accept.store(false, Ordering::SeqCst);
        });

        Ok(MultiplexerHandle {
            local_addr,
            shutdown,
            running,
            fanout,
        })
    }
}

/// Per-connection read/write loop.
async fn handle_connection(
    mut stream: TcpStream,
    id: ConnectionId,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    mode: MuxMode,
    bus: &Bus,
    shutdown: Arc<Notify>,
) -> Result<(), MuxError> {
    let mut buf = vec![0u8; READ_BUF];
    let mut frames = FrameBuffer::new();
    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    // EOF is the close signal.
                    Ok(0) => break,
                    Ok(n) => {
                        // Only whole lines reach the bus; a command
                        // split across TCP segments waits for its tail.
                        let Some(frame) = frames.push(&buf[..n]) else {
                            continue;
                        };
                        match &mode {
                            MuxMode::Device(device) => {
                                let reply = device.process_frame(&frame);
                                if !reply.is_empty() {
                                    bus.publish(
                                        Address::Connection(id),
                                        None,
                                        reply.into_bytes(),
                                    );
                                }
                            }
                            MuxMode::Bridge => {
                                bus.publish(
                                    Address::All,
                                    Some(EndpointId::Connection(id)),
                                    frame.into_bytes(),
                                );
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Read error on {}: {}", id, e);
                        break;
                    }
                }
            }
            payload = outbound.recv() => {
                match payload {
                    // Queue dropped by eviction: close the socket.
                    None => break,
                    Some(payload) => {
                        match tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(&payload)).await {
                            Ok(result) => result?,
                            Err(_) => {
                                debug!("Write to {} timed out, closing", id);
                                break;
                            }
                        }
                    }
                }
            }
            _ = shutdown.notified() => break,
        }
    }
    Ok(())
}

/// Handle to a started multiplexer.
pub struct MultiplexerHandle {
    local_addr: std::net::SocketAddr,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    fanout: Arc<Mutex<Fanout>>,
}

impl MultiplexerHandle {
    /// Actual bound address, useful when the configured port was 0.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Number of currently registered client connections.
    pub fn connection_count(&self) -> usize {
        self.fanout.lock().connection_count()
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the accept, fan-out and connection loops.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}
