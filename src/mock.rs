//! Scripted transports for tests and for running the stack without hardware.
//!
//! A [`MockTransport`] is a byte queue with a pluggable responder that sees
//! every complete frame written to it. [`MockDevice`] is a responder that
//! behaves like the monitor firmware. A [`MockHandle`] stays with the test
//! after the transport itself has been moved into a session or probe.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::errors::{DriverError, Result};
use crate::protocol::{self, Command, Frame, CODE_ACK, CODE_STREAM, PAYLOAD_LEN};
use crate::transport::{Connector, Transport};

pub type Responder = Box<dyn FnMut(&Frame) -> Vec<u8> + Send>;

struct MockState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    unparsed: Vec<u8>,
    read_failures: VecDeque<io::Error>,
    responder: Option<Responder>,
    open: bool,
    clear_input_calls: usize,
    timeout: Option<Duration>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            incoming: VecDeque::new(),
            written: Vec::new(),
            unparsed: Vec::new(),
            read_failures: VecDeque::new(),
            responder: None,
            open: true,
            clear_input_calls: 0,
            timeout: None,
        }
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory transport driven by a script.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport that never answers.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_responder(responder: Responder) -> Self {
        let transport = Self::new();
        lock(&transport.state).responder = Some(responder);
        transport
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        if let Some(err) = state.read_failures.pop_front() {
            return Err(err);
        }
        if state.incoming.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock idle"));
        }
        let n = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        state.written.extend_from_slice(buf);
        state.unparsed.extend_from_slice(buf);
        while let Some(frame) = protocol::take_frame(&mut state.unparsed) {
            if let Some(responder) = state.responder.as_mut() {
                let reply = responder(&frame);
                state.incoming.extend(reply);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.incoming.clear();
        state.clear_input_calls += 1;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        lock(&self.state).timeout = Some(timeout);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        lock(&self.state).open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }
}

/// Test-side view of a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Queue raw bytes for the host to read.
    pub fn push_bytes(&self, bytes: &[u8]) {
        lock(&self.state).incoming.extend(bytes.iter().copied());
    }

    pub fn push_frame(&self, frame: &Frame) {
        self.push_bytes(&frame.to_bytes());
    }

    /// Make the next `count` reads fail with `kind`.
    pub fn fail_reads(&self, count: usize, kind: io::ErrorKind) {
        let mut state = lock(&self.state);
        for i in 0..count {
            state
                .read_failures
                .push_back(io::Error::new(kind, format!("injected read failure {i}")));
        }
    }

    /// Make the next read fail with a specific error.
    pub fn fail_next_read(&self, err: io::Error) {
        lock(&self.state).read_failures.push_back(err);
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// Every complete frame the host has written so far.
    pub fn written_frames(&self) -> Vec<Frame> {
        let mut bytes = self.written();
        let mut frames = Vec::new();
        while let Some(frame) = protocol::take_frame(&mut bytes) {
            frames.push(frame);
        }
        frames
    }

    pub fn written_commands(&self) -> Vec<Command> {
        self.written_frames()
            .iter()
            .filter_map(|f| Command::from_opcode(f.code))
            .collect()
    }

    pub fn pending_input(&self) -> usize {
        lock(&self.state).incoming.len()
    }

    pub fn clear_input_calls(&self) -> usize {
        lock(&self.state).clear_input_calls
    }

    pub fn timeout(&self) -> Option<Duration> {
        lock(&self.state).timeout
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }
}

// ============================================================================
// Scripted device
// ============================================================================

/// Responder emulating the monitor firmware.
#[derive(Debug, Clone)]
pub struct MockDevice {
    acks: Vec<Command>,
    version: String,
    ack_code: u8,
    noise_frames: usize,
    sequence: u8,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            acks: Command::ALL.to_vec(),
            version: "MOCK-ECG 1.0".to_string(),
            ack_code: CODE_ACK,
            noise_frames: 0,
            sequence: 0,
        }
    }
}

impl MockDevice {
    /// Acknowledges every command and answers version queries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledges nothing.
    pub fn silent() -> Self {
        Self::default().acking(&[])
    }

    pub fn acking(mut self, commands: &[Command]) -> Self {
        self.acks = commands.to_vec();
        self
    }

    pub fn version(mut self, text: &str) -> Self {
        self.version = text.to_string();
        self
    }

    /// Acknowledge with the streaming code (0x20) like some firmware does.
    pub fn ack_with_stream_code(mut self) -> Self {
        self.ack_code = CODE_STREAM;
        self
    }

    /// Send `n` streaming samples ahead of every reply.
    pub fn stream_noise(mut self, n: usize) -> Self {
        self.noise_frames = n;
        self
    }

    pub fn into_transport(mut self) -> MockTransport {
        MockTransport::with_responder(Box::new(move |frame: &Frame| self.respond(frame)))
    }

    fn next_sequence(&mut self) -> u8 {
        let seq = self.sequence;
        self.sequence = (self.sequence + 1) % protocol::SEQUENCE_MODULUS;
        seq
    }

    fn respond(&mut self, frame: &Frame) -> Vec<u8> {
        let Some(command) = Command::from_opcode(frame.code) else {
            return Vec::new();
        };
        if !self.acks.contains(&command) {
            return Vec::new();
        }

        let mut out = Vec::new();
        for _ in 0..self.noise_frames {
            let seq = self.next_sequence();
            out.extend_from_slice(&Frame::stream_sample(seq, [0x80; PAYLOAD_LEN]).to_bytes());
        }

        let mut ack = Frame::ack(self.next_sequence(), command.opcode());
        ack.code = self.ack_code;
        out.extend_from_slice(&ack.to_bytes());

        if command == Command::VersionQuery {
            let seq = self.next_sequence();
            out.extend_from_slice(&Frame::version_data(seq, &self.version).to_bytes());
        }
        out
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Hands out pre-registered mock transports by endpoint name.
#[derive(Default)]
pub struct MockConnector {
    endpoints: Mutex<HashMap<String, MockTransport>>,
    handles: HashMap<String, MockHandle>,
    opened: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, name: &str, transport: MockTransport) -> Self {
        self.handles.insert(name.to_string(), transport.handle());
        match self.endpoints.get_mut() {
            Ok(map) => map.insert(name.to_string(), transport),
            Err(poisoned) => poisoned.into_inner().insert(name.to_string(), transport),
        };
        self
    }

    pub fn handle(&self, name: &str) -> Option<MockHandle> {
        self.handles.get(name).cloned()
    }

    /// Endpoints opened so far, in order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        endpoint: &str,
        _baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        let transport = self
            .endpoints
            .lock()
            .ok()
            .and_then(|mut map| map.remove(endpoint))
            .ok_or_else(|| {
                DriverError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such endpoint: {endpoint}"),
                ))
            })?;
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(endpoint.to_string());
        }
        lock(&transport.state).timeout = Some(timeout);
        Ok(Box::new(transport))
    }
}
