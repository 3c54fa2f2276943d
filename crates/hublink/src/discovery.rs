// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service discovery over UDP multicast.
//!
//! Instances advertise themselves with periodic JSON `Alive` beacons on
//! a multicast group and send a best-effort `Bye` on shutdown. The
//! browser side maintains a leased peer table: a peer appears on its
//! first beacon and vanishes on `Bye` or when its lease runs out, so a
//! crashed peer is detected even without a goodbye.

use crate::address::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Multicast discovery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Multicast group address.
    pub group: Ipv4Addr,
    /// Multicast UDP port.
    pub port: u16,
    /// Service type advertised and browsed for.
    pub service_type: String,
    /// Interval between `Alive` beacons.
    pub announce_interval_ms: u64,
    /// Peer lease; a peer silent for this long is considered gone.
    pub lease_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 41, 42),
            port: 5742,
            service_type: "_hublink._tcp".to_string(),
            announce_interval_ms: 2_000,
            lease_ms: 7_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.group), self.port)
    }
}

/// Property key carrying the served device's identifier.
pub const PROP_DEVICE_ID: &str = "deviceID";
/// Property key carrying the served device's type tag.
pub const PROP_DEVICE_TYPE: &str = "deviceType";
/// Property key carrying the served device's display name.
pub const PROP_DEVICE_NAME: &str = "deviceName";
/// Property key naming the peer's publish-channel TCP port.
pub const PROP_PUB_PORT: &str = "pub_port";
/// Property key naming the peer's subscribe-channel TCP port.
pub const PROP_SUB_PORT: &str = "sub_port";

/// Advertised properties of one reachable instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Unique instance identity, stable for the process lifetime.
    pub instance: PeerId,
    /// Instance display name.
    pub name: String,
    /// Service type tag.
    pub service_type: String,
    /// Reachable host address.
    pub address: IpAddr,
    /// Primary TCP port (the instance's multiplexed client endpoint).
    pub port: u16,
    /// Free-form properties. Bridgeable peers carry `deviceID`,
    /// `deviceType`, `deviceName` and the `pub_port`/`sub_port` pair.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ServiceRecord {
    /// The served device's identifier, if advertised.
    pub fn device_id(&self) -> Option<&str> {
        self.properties.get(PROP_DEVICE_ID).map(String::as_str)
    }

    /// The peer's publish-channel port, if advertised and well-formed.
    pub fn pub_port(&self) -> Option<u16> {
        self.port_property(PROP_PUB_PORT)
    }

    /// The peer's subscribe-channel port, if advertised and well-formed.
    pub fn sub_port(&self) -> Option<u16> {
        self.port_property(PROP_SUB_PORT)
    }

    fn port_property(&self, key: &str) -> Option<u16> {
        self.properties.get(key)?.parse().ok()
    }
}

/// One multicast beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Beacon {
    /// Periodic presence announcement carrying the full record.
    Alive(ServiceRecord),
    /// Best-effort goodbye sent on clean shutdown.
    Bye {
        instance: PeerId,
        service_type: String,
    },
}

/// Change in the browsed peer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A new instance was seen, or an instance re-announced with a
    /// changed record.
    Appeared(ServiceRecord),
    /// An instance said goodbye or its lease expired.
    Vanished(PeerId),
}

/// Best local IPv4 address to advertise.
pub fn local_ipv4() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Could not determine local IP, advertising loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Multicast receive socket: reuse-addr so multiple instances on one
/// host can browse the same group.
fn join_group(config: &DiscoveryConfig) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let bind: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    socket.bind(&bind.into())?;
    socket.join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)?;
    UdpSocket::from_std(socket.into())
}

/// Multicast send socket with loopback enabled so same-host instances
/// can see each other.
fn sender_socket() -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(true)?;
    let bind: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    socket.bind(&bind.into())?;
    UdpSocket::from_std(socket.into())
}

/// Periodic `Alive` announcer for one service record.
pub struct Announcer {
    shutdown: Arc<Notify>,
}

impl Announcer {
    /// Spawn the announce loop. The first beacon goes out immediately.
    pub fn start(config: DiscoveryConfig, record: ServiceRecord) -> std::io::Result<Self> {
        let socket = sender_socket()?;
        let shutdown = Arc::new(Notify::new());
        let shutdown_task = shutdown.clone();

        tokio::spawn(async move {
            let target = config.group_addr();
            let alive = match serde_json::to_vec(&Beacon::Alive(record.clone())) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Could not encode beacon: {}", e);
                    return;
                }
            };
            info!(
                "Advertising {} instance {} at {}:{}",
                record.service_type, record.instance, record.address, record.port
            );
            loop {
                if let Err(e) = socket.send_to(&alive, target).await {
                    debug!("Beacon send failed: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.announce_interval()) => {}
                    _ = shutdown_task.notified() => {
                        let bye = Beacon::Bye {
                            instance: record.instance,
                            service_type: record.service_type.clone(),
                        };
                        if let Ok(bytes) = serde_json::to_vec(&bye) {
                            let _ = socket.send_to(&bytes, target).await;
                        }
                        debug!("Announcer shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self { shutdown })
    }

    /// Stop announcing; a `Bye` beacon is sent best-effort.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Leased peer table driven by received beacons.
///
/// Socket-free so the appearance, refresh and expiry rules can be
/// exercised directly.
pub struct BrowserState {
    local: Option<PeerId>,
    service_type: String,
    lease: Duration,
    peers: HashMap<PeerId, PeerEntry>,
}

struct PeerEntry {
    record: ServiceRecord,
    deadline: Instant,
}

impl BrowserState {
    /// `local` is this node's own instance id; its beacons are ignored.
    pub fn new(service_type: &str, lease: Duration, local: Option<PeerId>) -> Self {
        Self {
            local,
            service_type: service_type.to_string(),
            lease,
            peers: HashMap::new(),
        }
    }

    /// Apply one received beacon.
    pub fn apply(&mut self, beacon: Beacon, now: Instant) -> Option<PeerEvent> {
        match beacon {
            Beacon::Alive(record) => {
                if record.service_type != self.service_type {
                    return None;
                }
                if self.local == Some(record.instance) {
                    return None;
                }
                let deadline = now + self.lease;
                match self.peers.get_mut(&record.instance) {
                    Some(entry) => {
                        entry.deadline = deadline;
                        if entry.record == record {
                            None
                        } else {
                            // Instance moved or was reconfigured.
                            entry.record = record.clone();
                            Some(PeerEvent::Appeared(record))
                        }
                    }
                    None => {
                        self.peers.insert(
                            record.instance,
                            PeerEntry {
                                record: record.clone(),
                                deadline,
                            },
                        );
                        Some(PeerEvent::Appeared(record))
                    }
                }
            }
            Beacon::Bye {
                instance,
                service_type,
            } => {
                if service_type != self.service_type {
                    return None;
                }
                self.peers
                    .remove(&instance)
                    .map(|_| PeerEvent::Vanished(instance))
            }
        }
    }

    /// Remove peers whose lease has run out.
    pub fn expire(&mut self, now: Instant) -> Vec<PeerEvent> {
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.peers.remove(id);
        }
        expired.into_iter().map(PeerEvent::Vanished).collect()
    }

    /// Number of currently-known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

/// Multicast browser emitting [`PeerEvent`]s.
pub struct Browser {
    events: mpsc::UnboundedReceiver<PeerEvent>,
    shutdown: Arc<Notify>,
}

impl Browser {
    /// Join the group and spawn the receive loop.
    pub fn start(config: DiscoveryConfig, local: Option<PeerId>) -> std::io::Result<Self> {
        let socket = join_group(&config)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let shutdown_task = shutdown.clone();

        tokio::spawn(async move {
            let mut state = BrowserState::new(&config.service_type, config.lease(), local);
            let mut buf = vec![0u8; 2048];
            let check_interval = config.lease() / 2;
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((n, from)) => {
                                match serde_json::from_slice::<Beacon>(&buf[..n]) {
                                    Ok(beacon) => {
                                        if let Some(event) =
                                            state.apply(beacon, Instant::now())
                                        {
                                            debug!("Peer event: {:?}", event);
                                            if tx.send(event).is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        debug!("Ignoring malformed beacon from {}: {}", from, e);
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("Beacon receive error: {}", e);
                            }
                        }
                    }
                    _ = tokio::time::sleep(check_interval) => {
                        for event in state.expire(Instant::now()) {
                            info!("Peer lease expired: {:?}", event);
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    _ = shutdown_task.notified() => {
                        debug!("Browser shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self { events: rx, shutdown })
    }

    /// Wait for the next peer event.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    /// Stop browsing.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Split into the raw event stream and a shutdown handle, for
    /// feeding the events into another component.
    pub fn split(self) -> (mpsc::UnboundedReceiver<PeerEvent>, BrowserHandle) {
        (
            self.events,
            BrowserHandle {
                shutdown: self.shutdown,
            },
        )
    }
}

/// Shutdown handle for a split-off [`Browser`].
pub struct BrowserHandle {
    shutdown: Arc<Notify>,
}

impl BrowserHandle {
    /// Stop browsing.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(instance: PeerId, port: u16) -> ServiceRecord {
        let mut properties = HashMap::new();
        properties.insert(PROP_DEVICE_ID.to_string(), "dev01".to_string());
        properties.insert(PROP_PUB_PORT.to_string(), "6000".to_string());
        properties.insert(PROP_SUB_PORT.to_string(), "6001".to_string());
        ServiceRecord {
            instance,
            name: "dev01".to_string(),
            service_type: "_hublink._tcp".to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            properties,
        }
    }

    #[test]
    fn test_first_alive_appears() {
        let mut state = BrowserState::new("_hublink._tcp", Duration::from_secs(5), None);
        let id = PeerId::new();
        let now = Instant::now();

        let event = state.apply(Beacon::Alive(record(id, 5001)), now);
        assert_eq!(event, Some(PeerEvent::Appeared(record(id, 5001))));
        assert_eq!(state.peer_count(), 1);

        // Identical refresh is silent.
        assert_eq!(state.apply(Beacon::Alive(record(id, 5001)), now), None);
    }

    #[test]
    fn test_changed_record_reannounces() {
        let mut state = BrowserState::new("_hublink._tcp", Duration::from_secs(5), None);
        let id = PeerId::new();
        let now = Instant::now();

        state.apply(Beacon::Alive(record(id, 5001)), now);
        let event = state.apply(Beacon::Alive(record(id, 5002)), now);
        assert_eq!(event, Some(PeerEvent::Appeared(record(id, 5002))));
        assert_eq!(state.peer_count(), 1);
    }

    #[test]
    fn test_bye_vanishes() {
        let mut state = BrowserState::new("_hublink._tcp", Duration::from_secs(5), None);
        let id = PeerId::new();
        let now = Instant::now();

        state.apply(Beacon::Alive(record(id, 5001)), now);
        let event = state.apply(
            Beacon::Bye {
                instance: id,
                service_type: "_hublink._tcp".to_string(),
            },
            now,
        );
        assert_eq!(event, Some(PeerEvent::Vanished(id)));
        assert_eq!(state.peer_count(), 0);

        // Bye for an unknown peer is silent.
        let event = state.apply(
            Beacon::Bye {
                instance: PeerId::new(),
                service_type: "_hublink._tcp".to_string(),
            },
            now,
        );
        assert_eq!(event, None);
    }

    #[test]
    fn test_lease_expiry_vanishes() {
        let mut state = BrowserState::new("_hublink._tcp", Duration::from_secs(5), None);
        let id = PeerId::new();
        let start = Instant::now();

        state.apply(Beacon::Alive(record(id, 5001)), start);
        assert!(state.expire(start + Duration::from_secs(4)).is_empty());

        let events = state.expire(start + Duration::from_secs(6));
        assert_eq!(events, vec![PeerEvent::Vanished(id)]);
        assert_eq!(state.peer_count(), 0);
    }

    #[test]
    fn test_refresh_extends_lease() {
        let mut state = BrowserState::new("_hublink._tcp", Duration::from_secs(5), None);
        let id = PeerId::new();
        let start = Instant::now();

        state.apply(Beacon::Alive(record(id, 5001)), start);
        state.apply(Beacon::Alive(record(id, 5001)), start + Duration::from_secs(4));
        assert!(state.expire(start + Duration::from_secs(6)).is_empty());
        assert_eq!(state.peer_count(), 1);
    }

    #[test]
    fn test_own_and_foreign_beacons_ignored() {
        let me = PeerId::new();
        let mut state = BrowserState::new("_hublink._tcp", Duration::from_secs(5), Some(me));
        let now = Instant::now();

        assert_eq!(state.apply(Beacon::Alive(record(me, 5001)), now), None);

        let mut other = record(PeerId::new(), 5001);
        other.service_type = "_other._tcp".to_string();
        assert_eq!(state.apply(Beacon::Alive(other), now), None);
        assert_eq!(state.peer_count(), 0);
    }

    #[test]
    fn test_beacon_json_roundtrip() {
        let rec = record(PeerId::new(), 5001);
        let json = serde_json::to_string(&Beacon::Alive(rec.clone())).unwrap();
        match serde_json::from_str::<Beacon>(&json).unwrap() {
            Beacon::Alive(back) => assert_eq!(back, rec),
            Beacon::Bye { .. } => panic!("wrong beacon kind"),
        }
    }

    #[test]
    fn test_record_port_properties() {
        let rec = record(PeerId::new(), 5001);
        assert_eq!(rec.device_id(), Some("dev01"));
        assert_eq!(rec.pub_port(), Some(6000));
        assert_eq!(rec.sub_port(), Some(6001));

        let mut bare = rec.clone();
        bare.properties.clear();
        assert_eq!(bare.device_id(), None);
        assert_eq!(bare.pub_port(), None);

        let mut garbled = rec;
        garbled
            .properties
            .insert(PROP_PUB_PORT.to_string(), "not-a-port".to_string());
        assert_eq!(garbled.pub_port(), None);
    }

    #[tokio::test]
    async fn test_announce_browse_roundtrip() {
        let config = DiscoveryConfig {
            group: Ipv4Addr::new(239, 255, 41, 43),
            port: 57430,
            service_type: "_hublink-test._tcp".to_string(),
            announce_interval_ms: 200,
            lease_ms: 2_000,
        };

        // Multicast may be unavailable in constrained environments.
        let browser = match Browser::start(config.clone(), None) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("skipping multicast test: {}", e);
                return;
            }
        };
        let mut browser = browser;

        let instance = PeerId::new();
        let mut rec = record(instance, 6001);
        rec.service_type = config.service_type.clone();
        let announcer = Announcer::start(config, rec.clone()).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), browser.recv())
            .await
            .expect("no beacon received")
            .unwrap();
        assert_eq!(event, PeerEvent::Appeared(rec));

        announcer.shutdown();
        let event = tokio::time::timeout(Duration::from_secs(5), browser.recv())
            .await
            .expect("no goodbye received")
            .unwrap();
        assert_eq!(event, PeerEvent::Vanished(instance));

        browser.shutdown();
    }
}
