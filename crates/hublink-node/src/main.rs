// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hublink demo node
//!
//! A small standalone device: one text box on one page. Clients can
//! connect directly to the multiplexed TCP endpoint; bridges attach
//! through the advertised publish/subscribe port pair. A clock task
//! pushes the current uptime into the text box every few seconds to
//! demonstrate unsolicited state.
//!
//! # Usage
//!
//! ```bash
//! hublink-node --device-id kitchen01 --port 5005
//! ```

use clap::Parser;
use hublink::discovery::{
    self, PROP_DEVICE_ID, PROP_DEVICE_NAME, PROP_DEVICE_TYPE, PROP_PUB_PORT, PROP_SUB_PORT,
};
use hublink::{
    Announcer, Bus, Device, DiscoveryConfig, PeerId, ProducerEndpoint, ServiceRecord,
    TcpMultiplexer,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod controls;

use controls::{Page, TextBox};

/// hublink demo node - a discoverable device with a few controls
#[derive(Parser, Debug)]
#[command(name = "hublink-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port for direct client connections (0 picks a free port)
    #[arg(short, long, default_value = "5005")]
    port: u16,

    /// Publish-channel port for attaching bridges (0 picks a free port)
    #[arg(long, default_value = "0")]
    pub_port: u16,

    /// Subscribe-channel port for attaching bridges (0 picks a free port)
    #[arg(long, default_value = "0")]
    sub_port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Device identifier
    #[arg(short, long, default_value = "node01")]
    device_id: String,

    /// Device display name
    #[arg(long, default_value = "Demo Node")]
    device_name: String,

    /// Do not advertise over multicast
    #[arg(long, default_value = "false")]
    no_advertise: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let device = Arc::new(Device::new("DemoNode", &args.device_id, &args.device_name));
    device.add_control(Arc::new(TextBox::new("uptime", "Uptime")));
    device.add_control(Arc::new(Page::new("main", "Main", &["uptime"])));

    let bus = Bus::new();
    let mux = TcpMultiplexer::device(&args.bind, args.port, device.clone(), bus.clone())
        .start()
        .await?;

    let producer = ProducerEndpoint::new(device.clone(), bus.clone());
    let ports = producer
        .serve(&args.bind, args.pub_port, args.sub_port)
        .await?;
    info!(
        "Node {} serving on {} (pub {} sub {})",
        args.device_id,
        mux.local_addr(),
        ports.pub_addr(),
        ports.sub_addr()
    );

    let announcer = if args.no_advertise {
        None
    } else {
        let config = DiscoveryConfig::default();
        let mut properties = HashMap::new();
        properties.insert(PROP_DEVICE_ID.to_string(), args.device_id.clone());
        properties.insert(PROP_DEVICE_TYPE.to_string(), "DemoNode".to_string());
        properties.insert(PROP_DEVICE_NAME.to_string(), args.device_name.clone());
        properties.insert(
            PROP_PUB_PORT.to_string(),
            ports.pub_addr().port().to_string(),
        );
        properties.insert(
            PROP_SUB_PORT.to_string(),
            ports.sub_addr().port().to_string(),
        );
        let record = ServiceRecord {
            instance: PeerId::new(),
            name: args.device_name.clone(),
            service_type: config.service_type.clone(),
            address: discovery::local_ipv4(),
            port: mux.local_addr().port(),
            properties,
        };
        Some(Announcer::start(config, record)?)
    };

    // Unsolicited pushes: tick the uptime text box.
    let started = Instant::now();
    let ticker = producer.clone();
    let ticker_device = device.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let uptime = format!("up {}s", started.elapsed().as_secs());
            ticker_device.process_frame(&format!(
                "{}\tTBOX\tuptime\t{}\n",
                ticker_device.device_id(),
                uptime
            ));
            ticker.send_control_state("TBOX_uptime");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping node...");

    if let Some(announcer) = &announcer {
        announcer.shutdown();
    }
    ports.shutdown();
    mux.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("Node stopped");
    Ok(())
}
