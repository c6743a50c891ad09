//! # BurstLink Core Library
//!
//! Core functionality for dispatching timed commands to ESP32 device fleets.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Line-oriented packet framing for the bridge firmware
//! - A bounded pool of device-side schedule slots
//! - The send/ACK/DONE dispatch state machine with retry on failure
//! - Latency decomposition into link and device time
//! - A simulated bridge for running without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use burstlink_core::config::DispatcherConfig;
//! use burstlink_core::protocol::{BaseCommand, CommandRequest, Dispatcher};
//! use std::time::Duration;
//!
//! let mut dispatcher = Dispatcher::open(DispatcherConfig::for_port("/dev/ttyUSB0"))?;
//!
//! let request = CommandRequest::new(BaseCommand::Play, Duration::from_secs(1))
//!     .targets([0, 1, 5]);
//! let outcome = dispatcher.send(&request);
//! println!("{:?}: {}", outcome.status, outcome.message);
//! ```

pub mod config;
pub mod demo;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::DispatcherConfig;
    pub use crate::demo::{SimulatedDevice, SimulationConfig};
    pub use crate::protocol::{
        BaseCommand, CommandId, CommandRequest, DispatchError, DispatchHandle, DispatchOutcome,
        DispatchStatus, Dispatcher, ErrorKind, ManualClock, MonotonicClock, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
