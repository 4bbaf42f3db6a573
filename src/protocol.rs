//! Frame codec for the monitor's fixed-length binary protocol.
//!
//! Every unit on the wire, in both directions, is a 22-byte frame:
//!
//! | Offset | Field            | Value                                   |
//! |--------|------------------|-----------------------------------------|
//! | 0      | start marker     | `0xE8`                                  |
//! | 1      | sequence counter | 0-63, wraps                             |
//! | 2      | length           | `0x11` (17), constant                   |
//! | 3      | code             | opcode (host→device) / response code    |
//! | 4      | checksum         | always `0x00`, never checked on receipt |
//! | 5-20   | payload          | 16 bytes                                |
//! | 21     | end marker       | `0x8E`                                  |
//!
//! Some firmware reuses the streaming code `0x20` for acknowledgements. Such a
//! frame is an ACK when its first payload byte is one of the four command
//! opcodes, and a stream sample otherwise.

use std::fmt;
use std::fmt::Write as _;

use crate::errors::FrameError;

// ============================================================================
// Constants
// ============================================================================

/// Total frame size in bytes.
pub const FRAME_LEN: usize = 22;
/// Payload size in bytes.
pub const PAYLOAD_LEN: usize = 16;

pub const START_MARKER: u8 = 0xE8;
pub const END_MARKER: u8 = 0x8E;
/// Value of the length byte: code + checksum + payload.
pub const LENGTH_FIELD: u8 = 0x11;

/// Sequence counters are 6 bits wide.
pub const SEQUENCE_MODULUS: u8 = 64;
const SEQUENCE_MASK: u8 = SEQUENCE_MODULUS - 1;

// Host → device opcodes
pub const OPCODE_START: u8 = 0x10;
pub const OPCODE_STOP: u8 = 0x11;
pub const OPCODE_VERSION: u8 = 0x14;
pub const OPCODE_CLOSE: u8 = 0x15;

// Device → host codes
pub const CODE_STREAM: u8 = 0x20;
pub const CODE_ACK: u8 = 0x21;
pub const CODE_VERSION_DATA: u8 = 0x24;

pub type Payload = [u8; PAYLOAD_LEN];

// ============================================================================
// Commands and responses
// ============================================================================

/// A control command understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Start,
    Stop,
    VersionQuery,
    Close,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::Start,
        Command::Stop,
        Command::VersionQuery,
        Command::Close,
    ];

    pub fn opcode(self) -> u8 {
        match self {
            Command::Start => OPCODE_START,
            Command::Stop => OPCODE_STOP,
            Command::VersionQuery => OPCODE_VERSION,
            Command::Close => OPCODE_CLOSE,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Command::ALL.into_iter().find(|c| c.opcode() == opcode)
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::VersionQuery => "VERSION",
            Command::Close => "CLOSE",
        }
    }

    /// Parse a command name as used by the Python layer and the CLI.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Command::Start),
            "stop" => Some(Command::Stop),
            "version" | "version_query" => Some(Command::VersionQuery),
            "close" => Some(Command::Close),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Meaning of a frame received from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Acknowledgement echoing the opcode it confirms.
    Ack { opcode: u8 },
    /// Reply to a version query.
    VersionData { payload: Payload },
    /// One continuous-data sample (payload still undecoded).
    StreamSample { payload: Payload },
    Unknown { code: u8 },
}

impl Response {
    pub fn is_ack_for(&self, command: Command) -> bool {
        matches!(self, Response::Ack { opcode } if *opcode == command.opcode())
    }

    pub fn is_stream_sample(&self) -> bool {
        matches!(self, Response::StreamSample { .. })
    }
}

/// Human-readable name for an opcode or response code.
pub fn code_name(code: u8) -> &'static str {
    match code {
        OPCODE_START => "START",
        OPCODE_STOP => "STOP",
        OPCODE_VERSION => "VERSION",
        OPCODE_CLOSE => "CLOSE",
        CODE_STREAM => "STREAM",
        CODE_ACK => "ACK",
        CODE_VERSION_DATA => "VERSION_DATA",
        _ => "UNKNOWN",
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One decoded 22-byte protocol frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Raw sequence byte. Use [`Frame::counter`] for the 6-bit counter.
    pub sequence: u8,
    pub length: u8,
    pub code: u8,
    /// Reserved. Written as zero, ignored on receipt.
    pub checksum: u8,
    pub payload: Payload,
}

impl Frame {
    /// Build a frame with constant length and a zero checksum.
    pub fn new(sequence: u8, code: u8, payload: Payload) -> Self {
        Self {
            sequence: sequence & SEQUENCE_MASK,
            length: LENGTH_FIELD,
            code,
            checksum: 0,
            payload,
        }
    }

    /// Device-side acknowledgement of `opcode`.
    pub fn ack(sequence: u8, opcode: u8) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0] = opcode;
        Self::new(sequence, CODE_ACK, payload)
    }

    /// Device-side streaming sample.
    pub fn stream_sample(sequence: u8, payload: Payload) -> Self {
        Self::new(sequence, CODE_STREAM, payload)
    }

    /// Device-side version reply; text longer than the payload is truncated.
    pub fn version_data(sequence: u8, text: &str) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        let bytes = text.as_bytes();
        let n = bytes.len().min(PAYLOAD_LEN);
        payload[..n].copy_from_slice(&bytes[..n]);
        Self::new(sequence, CODE_VERSION_DATA, payload)
    }

    /// Decode a frame. Length and both markers are checked before any other
    /// field is looked at.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != FRAME_LEN {
            return Err(FrameError::WrongLength(bytes.len()));
        }
        if bytes[0] != START_MARKER {
            return Err(FrameError::BadStartMarker(bytes[0]));
        }
        if bytes[FRAME_LEN - 1] != END_MARKER {
            return Err(FrameError::BadEndMarker(bytes[FRAME_LEN - 1]));
        }

        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&bytes[5..5 + PAYLOAD_LEN]);
        Ok(Self {
            sequence: bytes[1],
            length: bytes[2],
            code: bytes[3],
            checksum: bytes[4],
            payload,
        })
    }

    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[0] = START_MARKER;
        out[1] = self.sequence;
        out[2] = self.length;
        out[3] = self.code;
        out[4] = self.checksum;
        out[5..5 + PAYLOAD_LEN].copy_from_slice(&self.payload);
        out[FRAME_LEN - 1] = END_MARKER;
        out
    }

    /// The 6-bit sequence counter.
    #[inline]
    pub fn counter(&self) -> u8 {
        self.sequence & SEQUENCE_MASK
    }

    pub fn classify(&self) -> Response {
        match self.code {
            CODE_ACK => Response::Ack {
                opcode: self.payload[0],
            },
            CODE_VERSION_DATA => Response::VersionData {
                payload: self.payload,
            },
            CODE_STREAM => {
                if Command::from_opcode(self.payload[0]).is_some() {
                    Response::Ack {
                        opcode: self.payload[0],
                    }
                } else {
                    Response::StreamSample {
                        payload: self.payload,
                    }
                }
            }
            code => Response::Unknown { code },
        }
    }

    /// Multi-line, byte-by-byte breakdown for debug logs.
    pub fn describe(&self, direction: &str) -> String {
        let mut out = String::with_capacity(256);
        let _ = writeln!(out, "{direction} frame: {}", hex(&self.to_bytes()));
        let _ = writeln!(out, "  [1]    counter:  {:#04X} ({})", self.sequence, self.counter());
        let _ = writeln!(out, "  [2]    length:   {:#04X}", self.length);
        let _ = writeln!(
            out,
            "  [3]    code:     {:#04X} ({})",
            self.code,
            code_name(self.code)
        );
        let _ = writeln!(out, "  [4]    checksum: {:#04X}", self.checksum);
        let _ = write!(out, "  [5-20] payload:  {}", hex(&self.payload));
        if let Response::Ack { opcode } = self.classify() {
            let _ = write!(out, "\n         echoed:   {:#04X} ({})", opcode, code_name(opcode));
        }
        out
    }
}

/// Uppercase, space separated hex.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02X}");
    }
    out
}

// ============================================================================
// Codec
// ============================================================================

/// Command encoder holding the host-side sequence counter.
///
/// The counter is call-order state: it advances by one (mod 64) on every
/// [`FrameCodec::encode`], independent of frame content.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec {
    sequence: u8,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter that the next encoded frame will carry.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn encode(&mut self, command: Command) -> Frame {
        let frame = Frame::new(self.sequence, command.opcode(), [0u8; PAYLOAD_LEN]);
        self.sequence = (self.sequence + 1) % SEQUENCE_MODULUS;
        frame
    }
}

/// Pop the next valid frame off the front of `buf`.
///
/// Bytes before the first start marker are discarded. A marker that does not
/// begin a valid frame is dropped and scanning resumes after it. An incomplete
/// trailing frame is left in place for the next read.
pub(crate) fn take_frame(buf: &mut Vec<u8>) -> Option<Frame> {
    loop {
        let Some(start) = buf.iter().position(|&b| b == START_MARKER) else {
            buf.clear();
            return None;
        };
        if start > 0 {
            buf.drain(..start);
        }
        if buf.len() < FRAME_LEN {
            return None;
        }
        match Frame::decode(&buf[..FRAME_LEN]) {
            Ok(frame) => {
                buf.drain(..FRAME_LEN);
                return Some(frame);
            }
            Err(_) => {
                buf.drain(..1);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
