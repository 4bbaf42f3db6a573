//! Command/response exchanges with the device.
//!
//! A request writes one command frame and then polls the transport in small
//! sleep increments until a matching reply arrives or the timeout runs out.
//! Streaming samples that arrive in between are discarded. The call blocks
//! its thread for the whole wait; only the timeout ends it early.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, log_enabled, trace, warn, Level};

use crate::errors::{DriverError, Result};
use crate::protocol::{self, hex, Command, Frame, FrameCodec, Payload, Response};
use crate::transport::{self, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Default time to wait for a command reply.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Sleep between polls while waiting for a reply.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Overall budget for the STOP that precedes a version query.
pub const STOP_BUDGET: Duration = Duration::from_secs(3);

/// Longest single wait for one frame inside a budget.
pub const READ_SLICE: Duration = Duration::from_millis(500);

/// Pause after STOP before the device accepts a version query.
pub const SETTLE_AFTER_STOP: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 256;

// ============================================================================
// Data Types
// ============================================================================

/// Timing knobs for command exchanges.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub response_timeout: Duration,
    pub stop_budget: Duration,
    pub read_slice: Duration,
    pub settle_after_stop: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            response_timeout: RESPONSE_TIMEOUT,
            stop_budget: STOP_BUDGET,
            read_slice: READ_SLICE,
            settle_after_stop: SETTLE_AFTER_STOP,
        }
    }
}

/// Firmware version as reported by the device.
///
/// The payload is not integrity-checked on the wire, so `text` is a best-effort
/// rendering: trailing NULs are dropped and control bytes shown as `.`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub text: String,
    pub raw: Payload,
}

impl VersionInfo {
    pub fn from_payload(raw: Payload) -> Self {
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let text: String = String::from_utf8_lossy(&raw[..end])
            .chars()
            .map(|c| if c.is_control() { '.' } else { c })
            .collect();
        Self {
            text: text.trim().to_string(),
            raw,
        }
    }

    /// Raw payload as hex, for firmware that does not send text.
    pub fn hex(&self) -> String {
        hex(&self.raw)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Issues commands and waits for their replies.
///
/// The session owns the host-side sequence counter; the transport is borrowed
/// per call so it can be shared with the stream reader.
#[derive(Debug)]
pub struct CommandSession {
    codec: FrameCodec,
    config: SessionConfig,
    quiet: bool,
    rx: Vec<u8>,
}

impl Default for CommandSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl CommandSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            codec: FrameCodec::new(),
            config,
            quiet: false,
            rx: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Reduced verbosity, used while probing ports.
    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Sequence counter the next command will carry.
    pub fn next_sequence(&self) -> u8 {
        self.codec.sequence()
    }

    /// Send `command` and wait up to `timeout` for its reply.
    ///
    /// START, STOP and CLOSE complete on the matching ACK. VERSION first tries
    /// to STOP the device (continuing if that times out), then completes on
    /// the ACK followed by the version data, which is returned.
    ///
    /// # Errors
    /// - [`DriverError::Timeout`] if the device does not answer in time
    /// - [`DriverError::Io`] if the transport fails
    pub fn request(
        &mut self,
        transport: &mut dyn Transport,
        command: Command,
        timeout: Duration,
    ) -> Result<Response> {
        self.rx.clear();
        match command {
            Command::VersionQuery => self.query_version(transport, timeout),
            _ => {
                self.send(transport, command)?;
                self.await_reply(transport, command, timeout, timeout, |r| {
                    r.is_ack_for(command)
                })
            }
        }
    }

    /// Query and decode the firmware version.
    pub fn version(
        &mut self,
        transport: &mut dyn Transport,
        timeout: Duration,
    ) -> Result<VersionInfo> {
        match self.request(transport, Command::VersionQuery, timeout)? {
            Response::VersionData { payload } => {
                let version = VersionInfo::from_payload(payload);
                info!("device version: {} ({})", version.text, version.hex());
                Ok(version)
            }
            other => Err(DriverError::Protocol(format!(
                "unexpected reply to version query: {other:?}"
            ))),
        }
    }

    fn query_version(&mut self, transport: &mut dyn Transport, timeout: Duration) -> Result<Response> {
        // The device only answers version queries when idle.
        transport.clear_input()?;
        self.rx.clear();
        self.send(transport, Command::Stop)?;
        let (budget, slice) = (self.config.stop_budget, self.config.read_slice);
        match self.await_reply(transport, Command::Stop, budget, slice, |r| {
            r.is_ack_for(Command::Stop)
        }) {
            Ok(_) => debug!("STOP confirmed before version query"),
            Err(e) if e.is_timeout() => {
                warn!("no STOP ack before version query (device may already be idle)")
            }
            Err(e) => return Err(e),
        }
        thread::sleep(self.config.settle_after_stop);

        transport.clear_input()?;
        self.rx.clear();
        self.send(transport, Command::VersionQuery)?;
        let slice = self.config.read_slice;
        self.await_reply(transport, Command::VersionQuery, timeout, slice, |r| {
            r.is_ack_for(Command::VersionQuery)
        })?;
        self.await_reply(transport, Command::VersionQuery, timeout, slice, |r| {
            matches!(r, Response::VersionData { .. })
        })
    }

    fn send(&mut self, transport: &mut dyn Transport, command: Command) -> Result<()> {
        let frame = self.codec.encode(command);
        if self.quiet {
            trace!("{}", frame.describe("SEND"));
        } else {
            info!("sending {} command (seq={})", command, frame.sequence);
            if log_enabled!(Level::Debug) {
                debug!("{}", frame.describe("SEND"));
            }
        }
        transport.write_all(&frame.to_bytes())?;
        transport.flush()?;
        Ok(())
    }

    /// Read frames until one satisfies `accept` or `budget` runs out. Each
    /// individual wait is capped at `slice`.
    fn await_reply<F>(
        &mut self,
        transport: &mut dyn Transport,
        command: Command,
        budget: Duration,
        slice: Duration,
        accept: F,
    ) -> Result<Response>
    where
        F: Fn(&Response) -> bool,
    {
        let started = Instant::now();
        let deadline = started + budget;
        let mut skipped_samples = 0usize;

        loop {
            let now = Instant::now();
            if now >= deadline {
                if self.quiet {
                    debug!("no {} reply within {:?}", command, budget);
                } else {
                    warn!(
                        "no {} reply within {:?} ({} stream samples skipped)",
                        command, budget, skipped_samples
                    );
                }
                return Err(DriverError::Timeout {
                    command,
                    waited: started.elapsed(),
                });
            }

            let Some(frame) = self.next_frame(transport, slice.min(deadline - now))? else {
                continue;
            };
            let response = frame.classify();
            if response.is_stream_sample() {
                skipped_samples += 1;
                continue;
            }
            if self.quiet {
                trace!("{}", frame.describe("RECV"));
            } else if log_enabled!(Level::Debug) {
                debug!("{}", frame.describe("RECV"));
            }
            if accept(&response) {
                if skipped_samples > 0 {
                    debug!("skipped {} stream samples waiting for {}", skipped_samples, command);
                }
                return Ok(response);
            }
            debug!("ignoring {:?} while waiting for {}", response, command);
        }
    }

    /// Next valid frame from the transport, or `None` after `limit`.
    fn next_frame(&mut self, transport: &mut dyn Transport, limit: Duration) -> Result<Option<Frame>> {
        let deadline = Instant::now() + limit;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = protocol::take_frame(&mut self.rx) {
                return Ok(Some(frame));
            }
            let n = transport::read_available(transport, &mut chunk)?;
            if n > 0 {
                self.rx.extend_from_slice(&chunk[..n]);
            }
            if Instant::now() >= deadline {
                return Ok(protocol::take_frame(&mut self.rx));
            }
            if n == 0 {
                thread::sleep(self.config.poll_interval);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockTransport};
    use crate::protocol::{OPCODE_START, OPCODE_STOP, PAYLOAD_LEN};
    use pretty_assertions::assert_eq;
    use std::io;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(1),
            response_timeout: Duration::from_millis(200),
            stop_budget: Duration::from_millis(60),
            read_slice: Duration::from_millis(20),
            settle_after_stop: Duration::ZERO,
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[test]
    fn start_is_acknowledged() {
        let mut transport = MockDevice::new().into_transport();
        let mut session = CommandSession::new(fast_config());
        let reply = session
            .request(&mut transport, Command::Start, TIMEOUT)
            .unwrap();
        assert_eq!(reply, Response::Ack { opcode: OPCODE_START });
    }

    #[test]
    fn stream_samples_are_skipped() {
        let mut transport = MockDevice::new().stream_noise(40).into_transport();
        let mut session = CommandSession::new(fast_config());
        let reply = session
            .request(&mut transport, Command::Stop, TIMEOUT)
            .unwrap();
        assert_eq!(reply, Response::Ack { opcode: OPCODE_STOP });
    }

    #[test]
    fn ack_on_stream_code_is_accepted() {
        let mut transport = MockDevice::new().ack_with_stream_code().into_transport();
        let mut session = CommandSession::new(fast_config());
        assert!(session
            .request(&mut transport, Command::Close, TIMEOUT)
            .unwrap()
            .is_ack_for(Command::Close));
    }

    #[test]
    fn ack_for_other_opcode_is_not_a_reply() {
        let mut transport = MockTransport::with_responder(Box::new(|frame: &Frame| {
            let mut out = Frame::ack(0, OPCODE_STOP).to_bytes().to_vec();
            out.extend_from_slice(&Frame::ack(1, frame.code).to_bytes());
            out
        }));
        let mut session = CommandSession::new(fast_config());
        let reply = session
            .request(&mut transport, Command::Start, TIMEOUT)
            .unwrap();
        assert!(reply.is_ack_for(Command::Start));
    }

    #[test]
    fn silence_is_a_timeout() {
        let mut transport = MockDevice::silent().into_transport();
        let mut session = CommandSession::new(fast_config());
        let started = Instant::now();
        let err = session
            .request(&mut transport, Command::Start, Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn transport_failure_is_an_error() {
        let mut transport = MockDevice::silent().into_transport();
        transport
            .handle()
            .fail_next_read(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        let mut session = CommandSession::new(fast_config());
        let err = session
            .request(&mut transport, Command::Start, TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, DriverError::Io(_)), "{err}");
    }

    #[test]
    fn sequence_advances_per_command() {
        let mut transport = MockDevice::new().into_transport();
        let handle = transport.handle();
        let mut session = CommandSession::new(fast_config());
        session.request(&mut transport, Command::Start, TIMEOUT).unwrap();
        session.request(&mut transport, Command::Stop, TIMEOUT).unwrap();
        let seqs: Vec<u8> = handle.written_frames().iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(session.next_sequence(), 2);
    }

    #[test]
    fn version_query_stops_first() {
        let mut transport = MockDevice::new()
            .version("ECG v2.1")
            .stream_noise(3)
            .into_transport();
        let handle = transport.handle();
        let mut session = CommandSession::new(fast_config());

        let version = session.version(&mut transport, TIMEOUT).unwrap();
        assert_eq!(version.text, "ECG v2.1");
        assert_eq!(
            handle.written_commands(),
            vec![Command::Stop, Command::VersionQuery]
        );
        assert!(handle.clear_input_calls() >= 2);
    }

    #[test]
    fn version_query_continues_after_stop_timeout() {
        let mut transport = MockDevice::new()
            .acking(&[Command::VersionQuery])
            .version("FW-3")
            .into_transport();
        let handle = transport.handle();
        handle.push_frame(&Frame::stream_sample(9, [0x55; PAYLOAD_LEN]));
        let mut session = CommandSession::new(fast_config());

        let version = session.version(&mut transport, TIMEOUT).unwrap();
        assert_eq!(version.text, "FW-3");
        assert_eq!(
            handle.written_commands(),
            vec![Command::Stop, Command::VersionQuery]
        );
    }

    #[test]
    fn version_query_still_sent_when_device_is_mute() {
        let mut transport = MockDevice::silent().into_transport();
        let handle = transport.handle();
        let mut session = CommandSession::new(fast_config());

        let err = session
            .request(&mut transport, Command::VersionQuery, Duration::from_millis(40))
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(
            handle.written_commands(),
            vec![Command::Stop, Command::VersionQuery]
        );
    }

    #[test]
    fn version_text_is_best_effort() {
        let mut raw = [0u8; PAYLOAD_LEN];
        raw[..6].copy_from_slice(b" V1\x01\xFF ");
        let version = VersionInfo::from_payload(raw);
        assert_eq!(version.text, "V1.\u{FFFD}");
        assert!(version.hex().starts_with("20 56 31 01 FF 20 00"));

        let empty = VersionInfo::from_payload([0u8; PAYLOAD_LEN]);
        assert_eq!(empty.text, "");
    }
}
