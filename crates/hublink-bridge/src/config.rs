// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge daemon configuration.

use hublink::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Bridge daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Address to bind the client-facing listener to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port for client connections (default: 5001)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Device identifier advertised by the bridge
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Device type advertised by the bridge
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Human-readable bridge name
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Advertise this bridge's listener over multicast
    #[serde(default = "default_true")]
    pub advertise: bool,

    /// Browse for backend devices and bridge traffic to them
    #[serde(default = "default_true")]
    pub browse: bool,

    /// Multicast discovery parameters
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    5001
}

fn default_device_id() -> String {
    "3141592654".to_string()
}

fn default_device_type() -> String {
    "TCPBridge".to_string()
}

fn default_device_name() -> String {
    "MultipleTCP".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            device_id: default_device_id(),
            device_type: default_device_type(),
            device_name: default_device_name(),
            advertise: true,
            browse: true,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.device_id.is_empty() {
            return Err(ConfigError::InvalidValue(
                "device_id cannot be empty".into(),
            ));
        }
        if self.discovery.lease_ms <= self.discovery.announce_interval_ms {
            return Err(ConfigError::InvalidValue(
                "lease_ms must exceed announce_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::SerializeError(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.port, 5001);
        assert_eq!(config.device_type, "TCPBridge");
        assert!(config.advertise);
        assert!(config.browse);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.port, parsed.port);
        assert_eq!(config.device_id, parsed.device_id);
    }

    #[test]
    fn test_validation_port_zero() {
        let config = BridgeConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_lease_vs_interval() {
        let mut config = BridgeConfig::default();
        config.discovery.lease_ms = config.discovery.announce_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");

        let config = BridgeConfig {
            port: 6001,
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.port, 6001);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"port": 7001}"#).unwrap();

        let loaded = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.port, 7001);
        assert_eq!(loaded.device_type, "TCPBridge");
    }
}
