//! Dispatch errors

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while dispatching a command
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown command name: {0}")]
    UnknownCommand(String),

    #[error("Invalid delay: {0}")]
    InvalidDelay(String),

    #[error("Delay too short: {actual:?} (minimum allowed is {minimum:?})")]
    DelayTooShort { actual: Duration, minimum: Duration },

    #[error("No target devices specified")]
    NoTargets,

    #[error("Target id {0} out of range (max {max})", max = super::MAX_TARGET_ID)]
    TargetOutOfRange(u8),

    #[error("Invalid target id: {0:?}")]
    InvalidTarget(String),

    #[error("No free schedule slot: all {0} slots are pending")]
    NoFreeSlot(usize),

    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Not connected to device")]
    NotConnected,

    #[error("Device rejected command: {0}")]
    Nak(String),

    #[error("Timed out waiting for acknowledgement")]
    Timeout,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Coarse classification of a dispatch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad request shape, rejected before any I/O
    Validation,
    /// No schedule slot available, rejected before any I/O
    Capacity,
    /// Channel-level read/write failure
    Transport,
    /// NAK, timeout or malformed response from the device
    Protocol,
    /// Caller aborted the dispatch
    Cancelled,
}

impl DispatchError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::UnknownCommand(_)
            | DispatchError::InvalidDelay(_)
            | DispatchError::DelayTooShort { .. }
            | DispatchError::NoTargets
            | DispatchError::TargetOutOfRange(_)
            | DispatchError::InvalidTarget(_)
            | DispatchError::InvalidPacket(_) => ErrorKind::Validation,
            DispatchError::NoFreeSlot(_) => ErrorKind::Capacity,
            DispatchError::SerialError(_)
            | DispatchError::NotConnected
            | DispatchError::IoError(_) => ErrorKind::Transport,
            DispatchError::Nak(_) | DispatchError::Timeout | DispatchError::Malformed(_) => {
                ErrorKind::Protocol
            }
            DispatchError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether another attempt could succeed.
    ///
    /// A closed dispatcher will stay closed, so `NotConnected` is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::NotConnected => false,
            other => matches!(other.kind(), ErrorKind::Transport | ErrorKind::Protocol),
        }
    }
}
