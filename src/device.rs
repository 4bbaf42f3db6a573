//! The monitor link: one endpoint, its command session and its stream reader.
//!
//! [`EcgMonitor`] owns the transport exclusively. Commands and stream polls
//! borrow it for the duration of one call, so a command can never interleave
//! with a read. Link state moves `Idle -> Probing -> Streaming -> Stopping ->
//! Idle`; `Closed` is terminal.

use std::fmt;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::ingest::{IngestConfig, LossStats, SampleDecoder, StreamIngest};
use crate::probe::PortProbe;
use crate::protocol::{Command, Frame, Response};
use crate::session::{CommandSession, SessionConfig, VersionInfo};
use crate::transport::{
    Connector, NullTransport, SerialConnector, SerialTransport, Transport, DEFAULT_BAUD_RATE,
};

/// Endpoint name reported by a monitor with no hardware behind it.
pub const NULL_ENDPOINT: &str = "null";

// ============================================================================
// Configuration
// ============================================================================

/// Link settings. Durations are in milliseconds so the struct maps cleanly
/// onto stored settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub baud_rate: u32,
    /// Default wait for a command reply.
    pub response_timeout_ms: u64,
    /// Per-candidate wait while probing.
    pub probe_timeout_ms: u64,
    /// Transport read timeout while streaming; bounds one poll.
    pub stream_read_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            response_timeout_ms: crate::session::RESPONSE_TIMEOUT.as_millis() as u64,
            probe_timeout_ms: crate::probe::PROBE_TIMEOUT.as_millis() as u64,
            stream_read_timeout_ms: crate::transport::STREAM_READ_TIMEOUT.as_millis() as u64,
            poll_interval_ms: crate::session::POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl LinkConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stream_read_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_read_timeout_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            response_timeout: self.response_timeout(),
            ..SessionConfig::default()
        }
    }

    pub fn port_probe(&self) -> PortProbe {
        PortProbe {
            session: self.session_config(),
            ..PortProbe::new(self.baud_rate, self.probe_timeout())
        }
    }
}

// ============================================================================
// Link state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Idle,
    Probing,
    Streaming,
    Stopping,
    Closed,
}

impl LinkState {
    pub fn name(self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Probing => "probing",
            LinkState::Streaming => "streaming",
            LinkState::Stopping => "stopping",
            LinkState::Closed => "closed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// A connected ECG monitor.
///
/// # Example
/// ```ignore
/// let mut monitor = EcgMonitor::probe_and_open(&list_ports(), LinkConfig::default())?
///     .ok_or_else(|| anyhow!("no monitor found"))?;
/// monitor.start_streaming()?;
/// let frames = monitor.read_batch(64);
/// let stats = monitor.stop_streaming();
/// monitor.close()?;
/// ```
pub struct EcgMonitor {
    endpoint: String,
    transport: Box<dyn Transport>,
    session: CommandSession,
    ingest: StreamIngest,
    config: LinkConfig,
    state: LinkState,
    /// The device has acknowledged START and not been stopped since.
    device_started: bool,
}

impl fmt::Debug for EcgMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcgMonitor")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("device_started", &self.device_started)
            .finish()
    }
}

impl EcgMonitor {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open a known serial endpoint without probing.
    pub fn open(endpoint: &str, config: LinkConfig) -> Result<Self> {
        let transport = SerialTransport::open(endpoint, config.baud_rate, config.stream_read_timeout())?;
        info!("opened monitor link on {}", endpoint);
        Ok(Self::from_transport(endpoint, Box::new(transport), config))
    }

    /// Wrap an already-open transport.
    pub fn from_transport(
        endpoint: impl Into<String>,
        transport: Box<dyn Transport>,
        config: LinkConfig,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            session: CommandSession::new(config.session_config()),
            ingest: StreamIngest::default(),
            config,
            state: LinkState::Idle,
            device_started: false,
        }
    }

    /// A monitor with no hardware: commands time out and streams are empty.
    pub fn null(config: LinkConfig) -> Self {
        Self::from_transport(NULL_ENDPOINT, Box::new(NullTransport::default()), config)
    }

    pub fn with_ingest_config(mut self, ingest: IngestConfig) -> Self {
        self.ingest = StreamIngest::new(ingest);
        self
    }

    /// Probe `candidates` over real serial ports and open the first that
    /// acknowledges START. `Ok(None)` if none does.
    pub fn probe_and_open(candidates: &[String], config: LinkConfig) -> Result<Option<Self>> {
        Self::probe_with(&SerialConnector, candidates, config)
    }

    /// [`EcgMonitor::probe_and_open`] over any connector.
    pub fn probe_with<C>(connector: &C, candidates: &[String], config: LinkConfig) -> Result<Option<Self>>
    where
        C: Connector + ?Sized,
    {
        let Some(hit) = config.port_probe().scan(connector, candidates) else {
            return Ok(None);
        };
        let mut transport = hit.transport;
        transport.set_timeout(config.stream_read_timeout())?;
        let mut monitor = Self::from_transport(hit.endpoint, transport, config);
        // The probe's START was acknowledged; the device is already streaming.
        monitor.device_started = true;
        Ok(Some(monitor))
    }

    /// Drop the current endpoint and probe again. On failure the monitor is
    /// left idle on a null transport.
    pub fn reprobe<C>(&mut self, connector: &C, candidates: &[String]) -> Result<bool>
    where
        C: Connector + ?Sized,
    {
        self.ensure_open()?;
        if self.state == LinkState::Streaming {
            self.stop_streaming();
        }
        if let Err(e) = self.transport.close() {
            debug!("error closing {} before reprobe: {}", self.endpoint, e);
        }

        self.state = LinkState::Probing;
        self.device_started = false;
        match self.config.port_probe().scan(connector, candidates) {
            Some(hit) => {
                self.transport = hit.transport;
                self.endpoint = hit.endpoint;
                self.transport.set_timeout(self.config.stream_read_timeout())?;
                self.session = CommandSession::new(self.config.session_config());
                self.device_started = true;
                self.state = LinkState::Idle;
                Ok(true)
            }
            None => {
                self.transport = Box::new(NullTransport::default());
                self.endpoint = NULL_ENDPOINT.to_string();
                self.state = LinkState::Idle;
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// True while streaming and the reader has not stopped on a fault.
    pub fn is_running(&self) -> bool {
        self.state == LinkState::Streaming && self.ingest.is_running()
    }

    pub fn loss_stats(&self) -> LossStats {
        self.ingest.loss_stats()
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Send one command and wait for its reply. Does not change link state;
    /// use the streaming methods for that.
    ///
    /// # Errors
    /// - [`DriverError::NotReady`] after [`EcgMonitor::close`]
    /// - [`DriverError::Timeout`] if the device does not answer
    pub fn command(&mut self, command: Command, timeout: Duration) -> Result<Response> {
        self.ensure_open()?;
        let response = self.session.request(&mut *self.transport, command, timeout)?;
        match command {
            Command::Start => self.device_started = true,
            Command::Stop | Command::VersionQuery | Command::Close => self.device_started = false,
        }
        Ok(response)
    }

    /// Query the firmware version. A running stream is ended first, since the
    /// device has to be stopped to answer.
    pub fn version(&mut self) -> Result<VersionInfo> {
        self.ensure_open()?;
        if self.state == LinkState::Streaming {
            info!("ending stream on {} for version query", self.endpoint);
            self.state = LinkState::Stopping;
            let stats = self.ingest.stop();
            debug!(
                "stream before version query: accepted={}, sequence loss={}",
                stats.accepted_count, stats.sequence_loss
            );
            self.state = LinkState::Idle;
        }
        self.device_started = false;
        let timeout = self.config.response_timeout();
        self.session.version(&mut *self.transport, timeout)
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    /// Start a streaming session. A missing START acknowledgement is logged
    /// and tolerated; the stream reader tells whether data actually flows.
    pub fn start_streaming(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state == LinkState::Streaming {
            warn!("start_streaming: already streaming on {}", self.endpoint);
            return Ok(());
        }

        // Bytes queued before this session (probe leftovers, an earlier
        // stream) must not be counted against it.
        self.transport.clear_input()?;

        if self.device_started {
            debug!("device on {} already acknowledged START", self.endpoint);
        } else {
            let timeout = self.config.response_timeout();
            match self.session.request(&mut *self.transport, Command::Start, timeout) {
                Ok(_) => {}
                Err(e) if e.is_timeout() => {
                    warn!("no START acknowledgement from {}, reading anyway", self.endpoint)
                }
                Err(e) => return Err(e),
            }
            self.device_started = true;
        }

        self.transport.set_timeout(self.config.stream_read_timeout())?;
        self.ingest.start();
        self.state = LinkState::Streaming;
        info!("streaming from {}", self.endpoint);
        Ok(())
    }

    /// End the streaming session and return its loss statistics. The STOP
    /// command is best effort.
    pub fn stop_streaming(&mut self) -> LossStats {
        if self.state != LinkState::Streaming {
            return self.ingest.loss_stats();
        }
        self.state = LinkState::Stopping;
        let stats = self.ingest.stop();

        let timeout = self.config.response_timeout();
        if let Err(e) = self.session.request(&mut *self.transport, Command::Stop, timeout) {
            warn!("STOP not confirmed by {}: {}", self.endpoint, e);
        }
        self.device_started = false;
        self.state = LinkState::Idle;
        stats
    }

    /// Poll the stream for up to `max_frames` samples. Empty unless streaming.
    pub fn read_batch(&mut self, max_frames: usize) -> Vec<Frame> {
        if self.state != LinkState::Streaming {
            return Vec::new();
        }
        let frames = self.ingest.read_batch(&mut *self.transport, max_frames);
        self.check_reader();
        frames
    }

    /// [`EcgMonitor::read_batch`] with payloads run through `decoder`.
    pub fn read_samples<D>(&mut self, max_samples: usize, decoder: &mut D) -> Vec<D::Sample>
    where
        D: SampleDecoder,
    {
        if self.state != LinkState::Streaming {
            return Vec::new();
        }
        let samples = self
            .ingest
            .read_decoded(&mut *self.transport, max_samples, decoder);
        self.check_reader();
        samples
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Stop streaming, send CLOSE (best effort) and release the endpoint.
    pub fn close(&mut self) -> Result<()> {
        if self.state == LinkState::Closed {
            return Ok(());
        }
        if self.state == LinkState::Streaming {
            self.stop_streaming();
        }
        if self.transport.is_open() {
            let timeout = self.config.response_timeout();
            if let Err(e) = self.session.request(&mut *self.transport, Command::Close, timeout) {
                warn!("CLOSE not confirmed by {}: {}", self.endpoint, e);
            }
        }
        self.device_started = false;
        self.state = LinkState::Closed;
        self.transport.close()?;
        info!("closed monitor link on {}", self.endpoint);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == LinkState::Closed {
            return Err(DriverError::NotReady(format!("link to {} is closed", self.endpoint)));
        }
        Ok(())
    }

    /// Fold a reader that stopped itself back into the link state.
    fn check_reader(&mut self) {
        if self.state == LinkState::Streaming && !self.ingest.is_running() {
            error!("acquisition on {} stopped after transport failure", self.endpoint);
            self.device_started = false;
            self.state = LinkState::Idle;
        }
    }
}

impl Drop for EcgMonitor {
    fn drop(&mut self) {
        if self.state != LinkState::Closed {
            let _ = self.transport.close();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
