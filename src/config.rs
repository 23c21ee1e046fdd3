//! Meshmap Configuration
//!
//! Per-map settings: the context name that isolates maps sharing a channel,
//! the RPC and liveness timeouts, and the replication flavor knobs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::SendOptions;

/// Configuration for a single replicated map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// Map context name; maps only talk to peers announcing the same name
    pub map_name: String,

    /// Timeout for RPC messages in milliseconds (how long we wait for a reply)
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Liveness timeout in milliseconds; a map member that stays silent
    /// longer than this is considered dead
    #[serde(default = "default_access_timeout_ms")]
    pub access_timeout_ms: u64,

    /// Interval between heartbeat pings in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Send options handed to the channel on every outbound message
    #[serde(default)]
    pub send_options: SendOptions,

    /// Request full values during state transfer instead of proxy metadata
    #[serde(default)]
    pub transfer_full_state: bool,
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_access_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

impl MapConfig {
    /// Create a configuration with default timeouts for the given map name
    pub fn new(map_name: impl Into<String>) -> Self {
        Self {
            map_name: map_name.into(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            access_timeout_ms: default_access_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            send_options: SendOptions::default(),
            transfer_full_state: false,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: MapConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.map_name.is_empty() {
            return Err(Error::Config("map_name must not be empty".into()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(Error::Config("rpc_timeout_ms must be greater than 0".into()));
        }
        if self.access_timeout_ms == 0 {
            return Err(Error::Config(
                "access_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config(
                "heartbeat_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// The map context id shipped on every message (the name's bytes)
    pub fn map_id(&self) -> Vec<u8> {
        self.map_name.as_bytes().to_vec()
    }

    /// RPC timeout as a `Duration`
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Access (liveness) timeout as a `Duration`
    pub fn access_timeout(&self) -> Duration {
        Duration::from_millis(self.access_timeout_ms)
    }

    /// Heartbeat interval as a `Duration`
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MapConfig::new("sessions");
        assert_eq!(config.map_name, "sessions");
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
        assert_eq!(config.access_timeout(), Duration::from_secs(5));
        assert!(!config.transfer_full_state);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: MapConfig = toml::from_str(
            r#"
            map_name = "cache"
            rpc_timeout_ms = 2500
            transfer_full_state = true
            "#,
        )
        .unwrap();

        assert_eq!(config.map_name, "cache");
        assert_eq!(config.rpc_timeout_ms, 2500);
        assert_eq!(config.access_timeout_ms, 5000);
        assert!(config.transfer_full_state);
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let config = MapConfig::new("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_map_id_is_name_bytes() {
        let config = MapConfig::new("m1");
        assert_eq!(config.map_id(), b"m1".to_vec());
    }
}
