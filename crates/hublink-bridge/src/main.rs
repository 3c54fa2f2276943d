// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hublink bridge daemon
//!
//! Accepts many TCP clients on one port and bridges their traffic to
//! every backend device discovered on the local network:
//! - clients see one stable endpoint regardless of how devices come and go
//! - device replies and pushes fan out to every connected client
//! - devices are attached and detached as their multicast beacons appear
//!
//! # Usage
//!
//! ```bash
//! # Start bridge on default port (5001)
//! hublink-bridge
//!
//! # Custom port and config
//! hublink-bridge --port 5010 --config bridge.json
//!
//! # Serve clients only, without browsing for backends
//! hublink-bridge --no-browse
//! ```

use clap::Parser;
use hublink::discovery::{self, PROP_DEVICE_ID, PROP_DEVICE_NAME, PROP_DEVICE_TYPE};
use hublink::{
    Announcer, Browser, Bus, PeerId, ServiceRecord, TcpMultiplexer, TopologyManager,
};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

pub use config::BridgeConfig;

/// hublink bridge - one TCP endpoint for many discovered devices
#[derive(Parser, Debug)]
#[command(name = "hublink-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port for client connections
    #[arg(short, long, default_value = "5001")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not advertise this bridge over multicast
    #[arg(long, default_value = "false")]
    no_advertise: bool,

    /// Do not browse for backend devices
    #[arg(long, default_value = "false")]
    no_browse: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
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

    // Load or create config
    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        BridgeConfig::from_file(&config_path)?
    } else {
        BridgeConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            advertise: !args.no_advertise,
            browse: !args.no_browse,
            ..Default::default()
        }
    };
    config.validate()?;

    info!("+----------------------------------------------------+");
    info!(
        "|       hublink bridge v{}                        |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!(
        "|  Bind:      {:37} |",
        format!("{}:{}", config.bind_address, config.port)
    );
    info!("|  Device id: {:37} |", config.device_id);
    info!(
        "|  Advertise: {:37} |",
        if config.advertise { "enabled" } else { "disabled" }
    );
    info!(
        "|  Browse:    {:37} |",
        if config.browse { "enabled" } else { "disabled" }
    );
    info!("+----------------------------------------------------+");

    let bus = Bus::new();
    let instance = PeerId::new();

    let mux = TcpMultiplexer::bridge(&config.bind_address.to_string(), config.port, bus.clone())
        .start()
        .await?;

    let announcer = if config.advertise {
        // No pub/sub port pair: the bridge itself is not a bridgeable
        // backend, only a client-facing endpoint.
        let mut properties = HashMap::new();
        properties.insert(PROP_DEVICE_ID.to_string(), config.device_id.clone());
        properties.insert(PROP_DEVICE_TYPE.to_string(), config.device_type.clone());
        properties.insert(PROP_DEVICE_NAME.to_string(), config.device_name.clone());
        let record = ServiceRecord {
            instance,
            name: config.device_name.clone(),
            service_type: config.discovery.service_type.clone(),
            address: discovery::local_ipv4(),
            port: mux.local_addr().port(),
            properties,
        };
        Some(Announcer::start(config.discovery.clone(), record)?)
    } else {
        None
    };

    let topology = if config.browse {
        // The bridge's own beacons carry its instance id so the browser
        // never attaches the bridge to itself.
        let browser = Browser::start(config.discovery.clone(), Some(instance))?;
        let (events, browser_handle) = browser.split();
        Some((TopologyManager::start(bus.clone(), events), browser_handle))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping bridge...");

    if let Some(announcer) = &announcer {
        announcer.shutdown();
    }
    if let Some((topology, browser)) = &topology {
        browser.shutdown();
        topology.shutdown();
    }
    mux.shutdown();

    // Give the goodbye beacon a moment to leave.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    info!("Bridge stopped");
    Ok(())
}
