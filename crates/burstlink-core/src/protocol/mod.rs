//! Burst Command Protocol
//!
//! Implements the line-oriented command protocol spoken by the ESP32 bridge.
//!
//! A command is framed as a single comma-separated line, scheduled into one of
//! a fixed pool of device-side slots, and confirmed by an `ACK:OK` line carrying
//! the device's internal timing followed by a `DONE` completion marker.

pub mod actor;
pub mod clock;
pub mod commands;
pub mod dispatcher;
mod error;
pub mod latency;
pub mod packet;
pub mod serial;
pub mod slots;
pub mod stream;

pub use actor::DispatchHandle;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use commands::{BaseCommand, CommandId, CommandRequest, TargetSet};
pub use dispatcher::{DispatchOutcome, DispatchState, DispatchStatus, Dispatcher};
pub use error::{DispatchError, ErrorKind};
pub use latency::{transport_micros, DeviceTiming, LatencyReport};
pub use packet::{decode_ack, AckResult, Packet};
pub use serial::{detect_bridge, find_bridges, open_port, BridgeChip, BridgePort};
pub use slots::{SlotPool, SlotScheduler};
pub use stream::{SerialTransport, Transport};

/// Default baud rate for the serial bridge
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Number of schedule slots the device tracks
pub const DEFAULT_SLOT_COUNT: usize = 16;

/// Multiplier folding the slot index into the command code
pub const SLOT_CODE_STRIDE: u32 = 16;

/// Number of auxiliary payload values carried by every packet
pub const PAYLOAD_LEN: usize = 3;

/// Highest device id addressable by the target bitmask
pub const MAX_TARGET_ID: u8 = 63;

/// Default retry budget per dispatch
pub const DEFAULT_RETRIES: u32 = 3;

/// Line delimiter used in both directions
pub const LINE_DELIMITER: u8 = b'\n';
