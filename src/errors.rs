use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::Command;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("no {command} response within {waited:?}")]
    Timeout { command: Command, waited: Duration },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device not ready: {0}")]
    NotReady(String),
}

impl DriverError {
    /// True when the device simply did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout { .. })
    }
}

/// Why a byte sequence is not a frame. Only used for logging; invalid frames
/// are never propagated to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("expected 22 bytes, got {0}")]
    WrongLength(usize),
    #[error("bad start marker {0:#04X}")]
    BadStartMarker(u8),
    #[error("bad end marker {0:#04X}")]
    BadEndMarker(u8),
}

pub type Result<T> = std::result::Result<T, DriverError>;
