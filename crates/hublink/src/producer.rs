// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer endpoint: the device-side surface a bridge attaches to.
//!
//! Two listeners make up the endpoint, mirroring the advertised
//! `pub_port`/`sub_port` pair:
//!
//! - the **publish** listener streams the device's bus output (`ALL`
//!   and `ALARM`) to every attached consumer; inbound bytes on it are
//!   ignored,
//! - the **subscribe** listener accepts command frames, runs them
//!   through the engine and publishes replies to `ALL`, so they leave
//!   through the publish side to every attached consumer.
//!
//! The endpoint also carries the push API for unsolicited traffic:
//! state updates and popups to `ALL`, alarms to the dedicated `ALARM`
//! address.

use crate::address::Address;
use crate::bus::Bus;
use crate::device::Device;
use crate::multiplexer::{Fanout, MuxError};
use crate::protocol::FrameBuffer;
use crate::AddressFilter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Per-consumer outbound queue depth on the publish listener.
const OUTBOUND_QUEUE: usize = 64;

const READ_BUF: usize = 4096;

/// Upper bound on one blocking write to a consumer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Push-and-serve handle for one device.
#[derive(Clone)]
pub struct ProducerEndpoint {
    device: Arc<Device>,
    bus: Bus,
}

impl ProducerEndpoint {
    pub fn new(device: Arc<Device>, bus: Bus) -> Self {
        Self { device, bus }
    }

    /// Push a raw, already-framed line to every consumer.
    pub fn send_line(&self, line: String) {
        self.bus.publish(Address::All, None, line.into_bytes());
    }

    /// Push a single control's current state. Returns `false` when the
    /// control is unknown or has no state to report.
    pub fn send_control_state(&self, key: &str) -> bool {
        match self.device.control_state_line(key) {
            Some(line) => {
                self.send_line(line);
                true
            }
            None => false,
        }
    }

    /// Push a popup message to every consumer.
    pub fn send_popup(&self, title: &str, header: &str, body: &str) {
        self.send_line(self.device.popup_message(title, header, body));
    }

    /// Raise an alarm on the out-of-band alert channel.
    pub fn send_alarm(&self, alarm_id: &str, header: &str, body: &str) {
        let line = format!(
            "{}\tALM\t{}\t{}\t{}\n",
            self.device.device_id(),
            alarm_id,
            header,
            body
        );
        self.bus.publish(Address::Alarm, None, line.into_bytes());
    }

    /// Bind the publish/subscribe listener pair and spawn their loops.
    /// Port 0 picks free ports, reported through the handle.
    pub async fn serve(
        &self,
        bind_address: &str,
        pub_port: u16,
        sub_port: u16,
    ) -> Result<ProducerHandle, MuxError> {
        let pub_listener = bind(bind_address, pub_port).await?;
        let sub_listener = bind(bind_address, sub_port).await?;
        let pub_addr = pub_listener.local_addr()?;
        let sub_addr = sub_listener.local_addr()?;

        info!("Producer endpoint pub {} sub {}", pub_addr, sub_addr);

        let shutdown = Arc::new(Notify::new());
        let fanout = Arc::new(Mutex::new(Fanout::new()));

        // Publish side: bus output towards attached consumers.
        let mut sub = self
            .bus
            .subscribe(vec![AddressFilter::All, AddressFilter::Alarm]);
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
                                    warn!("Evicted slow or closed consumer {}", id);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_deliver.notified() => break,
                }
            }
        });

        let fanout_accept = fanout.clone();
        let shutdown_pub = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = pub_listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!("Publish consumer attached from {}", peer_addr);
                                let id = crate::ConnectionId::new();
                                let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
                                fanout_accept.lock().attach(id, tx);

                                let fanout = fanout_accept.clone();
                                let shutdown = shutdown_pub.clone();
                                tokio::spawn(async move {
                                    run_pub_consumer(stream, rx, shutdown).await;
                                    fanout.lock().detach(&id);
                                });
                            }
                            Err(e) => warn!("Publish accept error: {}", e),
                        }
                    }
                    _ = shutdown_pub.notified() => break,
                }
            }
        });

        // Subscribe side: command frames into the engine.
        let device = self.device.clone();
        let bus = self.bus.clone();
        let shutdown_sub = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = sub_listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!("Subscribe producer attached from {}", peer_addr);
                                let device = device.clone();
                                let bus = bus.clone();
                                let shutdown = shutdown_sub.clone();
                                tokio::spawn(async move {
                                    run_sub_producer(stream, device, bus, shutdown).await;
                                });
                            }
                            Err(e) => warn!("Subscribe accept error: {}", e),
                        }
                    }
                    _ = shutdown_sub.notified() => break,
                }
            }
        });

        Ok(ProducerHandle {
            pub_addr,
            sub_addr,
            shutdown,
            fanout,
        })
    }
}

async fn bind(bind_address: &str, port: u16) -> Result<TcpListener, MuxError> {
    let addr = format!("{}:{}", bind_address, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| MuxError::Bind(format!("{}: {}", addr, e)))
}

/// Publish-side consumer loop: write bus output, ignore inbound bytes,
/// close on EOF or eviction.
async fn run_pub_consumer(
    mut stream: TcpStream,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    shutdown: Arc<Notify>,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        tokio::select! {
            payload = outbound.recv() => {
                match payload {
                    None => break,
                    Some(payload) => {
                        match tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(&payload)).await {
                            Ok(Ok(())) => {}
                            // Failed or timed-out write: drop the consumer.
                            Ok(Err(_)) | Err(_) => break,
                        }
                    }
                }
            }
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    // A publish channel carries no inbound commands.
                    Ok(_) => {}
                }
            }
            _ = shutdown.notified() => break,
        }
    }
}

/// Subscribe-side producer loop: frames into the engine, replies out
/// through the bus so they leave on the publish side.
async fn run_sub_producer(
    mut stream: TcpStream,
    device: Arc<Device>,
    bus: Bus,
    shutdown: Arc<Notify>,
) {
    let mut buf = vec![0u8; READ_BUF];
    let mut frames = FrameBuffer::new();
    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let Some(frame) = frames.push(&buf[..n]) else {
                            continue;
                        };
                        let reply = device.process_frame(&frame);
                        if !reply.is_empty() {
                            bus.publish(Address::All, None, reply.into_bytes());
                        }
                    }
                }
            }
            _ = shutdown.notified() => break,
        }
    }
}

/// Handle to a served producer endpoint.
pub struct ProducerHandle {
    pub_addr: std::net::SocketAddr,
    sub_addr: std::net::SocketAddr,
    shutdown: Arc<Notify>,
    fanout: Arc<Mutex<Fanout>>,
}

impl ProducerHandle {
    /// Bound address of the publish listener.
    pub fn pub_addr(&self) -> std::net::SocketAddr {
        self.pub_addr
    }

    /// Bound address of the subscribe listener.
    pub fn sub_addr(&self) -> std::net::SocketAddr {
        self.sub_addr
    }

    /// Number of attached publish-side consumers.
    pub fn consumer_count(&self) -> usize {
        self.fanout.lock().connection_count()
    }

    /// Stop both listeners and every consumer loop.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Control;
    use parking_lot::RwLock;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct Counter {
        value: RwLock<i64>,
    }

    impl Control for Counter {
        fn control_type(&self) -> &str {
            "DIAL"
        }

        fn control_id(&self) -> &str {
            "c1"
        }

        fn receive(&self, _args: &[&str]) {}

        fn current_state(&self) -> Option<String> {
            Some(format!("DIAL\tc1\t{}", self.value.read()))
        }

        fn configuration(&self) -> String {
            "DIAL\t{\"controlID\": \"c1\"}".to_string()
        }
    }

    fn setup() -> (ProducerEndpoint, Bus, Arc<Device>) {
        let bus = Bus::new();
        let device = Arc::new(Device::new("Gauge", "dev01", "Kitchen"));
        device.add_control(Arc::new(Counter {
            value: RwLock::new(7),
        }));
        let producer = ProducerEndpoint::new(device.clone(), bus.clone());
        (producer, bus, device)
    }

    #[tokio::test]
    async fn test_control_state_pushed_to_all() {
        let (producer, bus, _device) = setup();
        let mut sub = bus.subscribe(vec![AddressFilter::All]);

        assert!(producer.send_control_state("DIAL_c1"));
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload, b"dev01\tDIAL\tc1\t7\n");
        assert!(msg.origin.is_none());
    }

    #[tokio::test]
    async fn test_unknown_control_not_pushed() {
        let (producer, bus, _device) = setup();
        let mut sub = bus.subscribe(vec![AddressFilter::All]);

        assert!(!producer.send_control_state("DIAL_missing"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_alarm_goes_to_alarm_address() {
        let (producer, bus, _device) = setup();
        let mut alarms = bus.subscribe(vec![AddressFilter::Alarm]);
        let mut all = bus.subscribe(vec![AddressFilter::All]);

        producer.send_alarm("a1", "Oven", "Too hot");
        let msg = alarms.recv().await.unwrap();
        assert_eq!(msg.payload, b"dev01\tALM\ta1\tOven\tToo hot\n");
        assert!(all.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_popup_pushed_to_all() {
        let (producer, bus, _device) = setup();
        let mut sub = bus.subscribe(vec![AddressFilter::All]);

        producer.send_popup("Alert", "Oven", "Preheated");
        assert_eq!(
            sub.recv().await.unwrap().payload,
            b"dev01\tMSSG\tAlert\tOven\tPreheated\n"
        );
    }

    #[tokio::test]
    async fn test_push_reaches_attached_pub_consumer() {
        let (producer, _bus, _device) = setup();
        let handle = producer.serve("127.0.0.1", 0, 0).await.unwrap();

        let mut consumer = TcpStream::connect(handle.pub_addr()).await.unwrap();
        // Wait for the consumer to be registered before pushing.
        for _ in 0..100 {
            if handle.consumer_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.consumer_count(), 1);

        assert!(producer.send_control_state("DIAL_c1"));

        let mut buf = vec![0u8; 256];
        let n = timeout(WAIT, consumer.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"dev01\tDIAL\tc1\t7\n");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_sub_command_split_across_segments() {
        let (producer, _bus, _device) = setup();
        let handle = producer.serve("127.0.0.1", 0, 0).await.unwrap();

        let mut consumer = TcpStream::connect(handle.pub_addr()).await.unwrap();
        for _ in 0..100 {
            if handle.consumer_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut commander = TcpStream::connect(handle.sub_addr()).await.unwrap();
        commander.write_all(b"dev01\tSTAT").await.unwrap();
        commander.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        commander.write_all(b"US\n").await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = timeout(WAIT, consumer.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"dev01\tDIAL\tc1\t7\n");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_sub_command_answered_on_pub_side() {
        let (producer, _bus, _device) = setup();
        let handle = producer.serve("127.0.0.1", 0, 0).await.unwrap();

        let mut consumer = TcpStream::connect(handle.pub_addr()).await.unwrap();
        for _ in 0..100 {
            if handle.consumer_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut commander = TcpStream::connect(handle.sub_addr()).await.unwrap();
        commander.write_all(b"dev01\tSTATUS\n").await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = timeout(WAIT, consumer.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"dev01\tDIAL\tc1\t7\n");

        // Nothing comes back on the subscribe channel itself.
        assert!(timeout(Duration::from_millis(300), commander.read(&mut buf))
            .await
            .is_err());

        handle.shutdown();
    }
}
