//! Acquisition layer for framed-protocol ECG monitors, with Python bindings.
//!
//! The monitor talks over a serial port using fixed 22-byte frames. This crate
//! finds the port the monitor is on, exchanges control commands with it, and
//! ingests its ~500 samples/s stream with sequence-based loss accounting.
//!
//! # Timing and Loss
//!
//! Frames carry no timestamps, only a 6-bit counter. Two independent loss
//! estimates are kept per streaming session:
//!
//! 1. Sequence loss: gaps in the counter between consecutive accepted frames
//! 2. Throughput loss: `500 Hz × elapsed − accepted`
//!
//! Everything is poll-driven from the caller's thread; there is no background
//! reader.

pub mod device;
pub mod errors;
pub mod ingest;
pub mod logging;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod probe;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use device::{EcgMonitor, LinkConfig, LinkState};
pub use errors::*;
pub use ingest::{IngestConfig, IngestState, LossStats, SampleDecoder, StreamIngest, NOMINAL_RATE_HZ};
pub use probe::{PortProbe, ProbeHit};
pub use protocol::{Command, Frame, FrameCodec, Payload, Response, FRAME_LEN};
pub use session::{CommandSession, SessionConfig, VersionInfo};
pub use transport::{
    list_ports, Connector, NullTransport, SerialConnector, SerialTransport, Transport,
};
