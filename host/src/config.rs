//! Serial link configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SerialError};

/// Configuration for one BLE serial link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device address (MAC on Linux/Windows, platform identifier elsewhere)
    pub address: String,
    /// Overall bound for connect, write, read and disconnect
    pub timeout_ms: u64,
    /// How long to wait for an ACK before sending a resend request
    pub packet_timeout_ms: u64,
    /// Per-attempt wait on the inbound queue while reading
    pub read_poll_ms: u64,
    /// Use this MTU instead of the transport's
    pub mtu_override: Option<usize>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            timeout_ms: 10_000,
            packet_timeout_ms: 500,
            read_poll_ms: 5,
            mtu_override: None,
        }
    }
}

impl SerialConfig {
    /// Default configuration for the device at `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SerialError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }
}
