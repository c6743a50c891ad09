//! Dispatcher configuration
//!
//! Stored as JSON. Every field has a default, so a partial file only needs
//! to name what it changes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_RETRIES, DEFAULT_SLOT_COUNT};

/// Settings for opening the bridge and running dispatches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Serial port name (e.g. "/dev/ttyUSB0" or "COM13")
    pub port_name: String,

    /// Baud rate
    pub baud_rate: u32,

    /// Transport-level read timeout in milliseconds
    pub read_timeout_ms: u64,

    /// Wait after opening the port before waking the bridge, in milliseconds
    pub settle_delay_ms: u64,

    /// Added to the command delay to bound the ACK wait, and to the target
    /// time to bound the DONE wait, in milliseconds
    pub ack_margin_ms: u64,

    /// Pause between attempts in milliseconds
    pub retry_backoff_ms: u64,

    /// Longest single read before checking for cancellation, in milliseconds
    pub poll_interval_ms: u64,

    /// Number of device-side schedule slots
    pub slot_count: usize,

    /// Retry budget for requests that do not set one
    pub default_retries: u32,

    /// Shortest accepted command delay in milliseconds
    pub min_delay_ms: u64,

    /// Accept requests with no target devices
    pub allow_empty_targets: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 100,
            settle_delay_ms: 2000,
            ack_margin_ms: 2000,
            retry_backoff_ms: 100,
            poll_interval_ms: 50,
            slot_count: DEFAULT_SLOT_COUNT,
            default_retries: DEFAULT_RETRIES,
            min_delay_ms: 0,
            allow_empty_targets: false,
        }
    }
}

impl DispatcherConfig {
    /// Default settings for the given port
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    /// Parse from a JSON string
    pub fn from_json_str(content: &str) -> io::Result<Self> {
        serde_json::from_str(content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    /// Transport-level read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Wait after opening before the wake-up newline
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Margin added to the ACK and DONE deadlines
    pub fn ack_margin(&self) -> Duration {
        Duration::from_millis(self.ack_margin_ms)
    }

    /// Pause between attempts
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Read slice, never zero
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Shortest accepted command delay
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }
}
