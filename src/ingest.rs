//! Continuous stream reader.
//!
//! [`StreamIngest`] is polled by the caller (roughly every 30 ms). Each poll
//! does one read of adaptive size, resynchronizes on the start marker,
//! validates and classifies candidates, tracks the 6-bit sequence counter for
//! gaps, and hands back the accepted streaming frames. Transport failures are
//! absorbed: they are counted and, when they look fatal, stop the reader.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::logging::{EveryNth, Throttle};
use crate::protocol::{Frame, Payload, FRAME_LEN, SEQUENCE_MODULUS, START_MARKER};
use crate::transport::{is_idle_error, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Nominal sample rate of the monitor; one streaming frame per sample.
pub const NOMINAL_RATE_HZ: u32 = 500;

pub const BASE_READ_SIZE: usize = 4096;
pub const MEDIUM_READ_SIZE: usize = 8192;
pub const LARGE_READ_SIZE: usize = 16384;

/// Backlog above which reads grow to [`MEDIUM_READ_SIZE`].
pub const MEDIUM_BACKLOG: usize = 20_000;
/// Backlog above which reads grow to [`LARGE_READ_SIZE`]; also the level
/// at which the backlog is warned about.
pub const LARGE_BACKLOG: usize = 50_000;

/// A buffer this large with no start marker in it is thrown away.
pub const DESYNC_LIMIT: usize = 100_000;
/// Garbage ahead of a start marker beyond this size is reported.
pub const GARBAGE_LIMIT: usize = 10_000;

/// Consecutive read failures that stop the reader.
pub const FATAL_ERROR_THRESHOLD: u32 = 20;

/// Upper bound on frames carried over between polls.
pub const MAX_PENDING: usize = 5_000;

const MIN_ITERATIONS: usize = 500;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub nominal_rate_hz: u32,
    pub base_read_size: usize,
    pub medium_read_size: usize,
    pub large_read_size: usize,
    pub medium_backlog: usize,
    pub large_backlog: usize,
    pub desync_limit: usize,
    pub garbage_limit: usize,
    pub fatal_error_threshold: u32,
    /// Sequence-gap warnings are logged once per this many gaps.
    pub loss_log_every: u64,
    /// An accepted-frame progress line is logged every this many frames.
    pub progress_log_every: u64,
    pub backlog_warn_interval: Duration,
    pub max_pending: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            nominal_rate_hz: NOMINAL_RATE_HZ,
            base_read_size: BASE_READ_SIZE,
            medium_read_size: MEDIUM_READ_SIZE,
            large_read_size: LARGE_READ_SIZE,
            medium_backlog: MEDIUM_BACKLOG,
            large_backlog: LARGE_BACKLOG,
            desync_limit: DESYNC_LIMIT,
            garbage_limit: GARBAGE_LIMIT,
            fatal_error_threshold: FATAL_ERROR_THRESHOLD,
            loss_log_every: 50,
            progress_log_every: 500,
            backlog_warn_interval: Duration::from_secs(5),
            max_pending: MAX_PENDING,
        }
    }
}

impl IngestConfig {
    /// How many bytes to ask the transport for, given the current backlog.
    pub fn read_size(&self, backlog: usize) -> usize {
        if backlog > self.large_backlog {
            self.large_read_size
        } else if backlog > self.medium_backlog {
            self.medium_read_size
        } else {
            self.base_read_size
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Loss accounting for one streaming session.
///
/// `sequence_loss` counts frames missing from counter gaps; `throughput_loss`
/// compares the accepted count with what the nominal rate predicts for the
/// elapsed time. The two are independent estimates and are reported side by
/// side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossStats {
    pub accepted_count: u64,
    pub sequence_loss: u64,
    pub expected_count: u64,
    pub throughput_loss: u64,
    pub throughput_loss_percent: f64,
    pub elapsed_ms: u64,
    /// Candidates starting with a marker but failing validation.
    pub framing_drops: u64,
    /// Whole-buffer discards after losing sync.
    pub desync_resets: u64,
    /// Bytes skipped while looking for a start marker.
    pub discarded_bytes: u64,
    pub read_errors: u64,
    /// Accepted frames dropped because the carry-over queue was full.
    pub overflow_drops: u64,
    pub decode_failures: u64,
}

impl LossStats {
    /// Expected frame count, shortfall and shortfall percentage for `accepted`
    /// frames over `elapsed` at `rate_hz`.
    pub fn throughput_estimate(rate_hz: u32, accepted: u64, elapsed: Duration) -> (u64, u64, f64) {
        let expected = (f64::from(rate_hz) * elapsed.as_secs_f64()) as u64;
        let lost = expected.saturating_sub(accepted);
        let percent = if expected > 0 {
            lost as f64 / expected as f64 * 100.0
        } else {
            0.0
        };
        (expected, lost, percent)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    accepted: u64,
    sequence_loss: u64,
    gap_events: u64,
    framing_drops: u64,
    desync_resets: u64,
    discarded_bytes: u64,
    read_errors: u64,
    overflow_drops: u64,
    decode_failures: u64,
    ignored: u64,
}

// ============================================================================
// Decoding
// ============================================================================

/// Turns an accepted streaming payload into an application sample.
///
/// Returning `None` marks the payload as undecodable; it is counted and
/// skipped, never retried.
pub trait SampleDecoder {
    type Sample;

    fn decode(&mut self, payload: &Payload) -> Option<Self::Sample>;
}

impl<T, F> SampleDecoder for F
where
    F: FnMut(&Payload) -> Option<T>,
{
    type Sample = T;

    fn decode(&mut self, payload: &Payload) -> Option<T> {
        self(payload)
    }
}

// ============================================================================
// Reader
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    NotStarted,
    Running,
    Stopped,
}

enum Scan {
    Frame(Frame),
    Dropped,
    NeedMore,
}

#[derive(Debug)]
pub struct StreamIngest {
    config: IngestConfig,
    state: IngestState,
    buffer: Vec<u8>,
    pending: VecDeque<Frame>,
    last_counter: Option<u8>,
    started_at: Option<Instant>,
    stopped_after: Option<Duration>,
    counters: Counters,
    consecutive_errors: u32,
    loss_log: EveryNth,
    backlog_warn: Throttle,
}

impl Default for StreamIngest {
    fn default() -> Self {
        Self::new(IngestConfig::default())
    }
}

impl StreamIngest {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            loss_log: EveryNth::new(config.loss_log_every),
            backlog_warn: Throttle::new(config.backlog_warn_interval),
            buffer: Vec::with_capacity(config.large_read_size),
            config,
            state: IngestState::NotStarted,
            pending: VecDeque::new(),
            last_counter: None,
            started_at: None,
            stopped_after: None,
            counters: Counters::default(),
            consecutive_errors: 0,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == IngestState::Running
    }

    /// Bytes received but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Accepted frames waiting for the next poll.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Begin a new session. All counters and buffers start from zero.
    pub fn start(&mut self) {
        self.buffer.clear();
        self.pending.clear();
        self.last_counter = None;
        self.counters = Counters::default();
        self.consecutive_errors = 0;
        self.loss_log = EveryNth::new(self.config.loss_log_every);
        self.backlog_warn = Throttle::new(self.config.backlog_warn_interval);
        self.started_at = Some(Instant::now());
        self.stopped_after = None;
        self.state = IngestState::Running;
        info!("stream ingest started");
    }

    /// End the session and report its totals.
    pub fn stop(&mut self) -> LossStats {
        if self.state == IngestState::Running {
            self.halt();
        }
        let stats = self.loss_stats();
        info!(
            "stream ingest stopped: accepted={}, expected={}, throughput loss={} ({:.2}%), sequence loss={}",
            stats.accepted_count,
            stats.expected_count,
            stats.throughput_loss,
            stats.throughput_loss_percent,
            stats.sequence_loss
        );
        if stats.framing_drops > 0 || stats.desync_resets > 0 || stats.overflow_drops > 0 {
            info!(
                "stream ingest framing: drops={}, desync resets={}, discarded bytes={}, overflow={}",
                stats.framing_drops,
                stats.desync_resets,
                stats.discarded_bytes,
                stats.overflow_drops
            );
        }
        if self.counters.ignored > 0 {
            debug!("ignored {} non-stream frame(s) during acquisition", self.counters.ignored);
        }
        stats
    }

    /// Statistics so far. While running, the throughput estimate uses the
    /// time elapsed up to now; after a stop it is frozen.
    pub fn loss_stats(&self) -> LossStats {
        let elapsed = match (self.stopped_after, self.started_at) {
            (Some(frozen), _) => frozen,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        };
        let c = &self.counters;
        let (expected_count, throughput_loss, throughput_loss_percent) =
            LossStats::throughput_estimate(self.config.nominal_rate_hz, c.accepted, elapsed);
        LossStats {
            accepted_count: c.accepted,
            sequence_loss: c.sequence_loss,
            expected_count,
            throughput_loss,
            throughput_loss_percent,
            elapsed_ms: elapsed.as_millis() as u64,
            framing_drops: c.framing_drops,
            desync_resets: c.desync_resets,
            discarded_bytes: c.discarded_bytes,
            read_errors: c.read_errors,
            overflow_drops: c.overflow_drops,
            decode_failures: c.decode_failures,
        }
    }

    /// Poll once and return up to `max_frames` accepted streaming frames.
    ///
    /// Never fails: read errors are counted and, when fatal, stop the reader,
    /// which the caller observes through [`StreamIngest::is_running`].
    pub fn read_batch(&mut self, transport: &mut dyn Transport, max_frames: usize) -> Vec<Frame> {
        if !self.is_running() || max_frames == 0 {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(max_frames.min(self.config.max_pending));
        while out.len() < max_frames {
            match self.pending.pop_front() {
                Some(frame) => out.push(frame),
                None => break,
            }
        }

        self.fill(transport);
        if !self.is_running() {
            return out;
        }

        let framing_before = self.counters.framing_drops;
        let iteration_cap = (max_frames * 5).max(MIN_ITERATIONS);
        for _ in 0..iteration_cap {
            match self.scan() {
                Scan::Frame(frame) => {
                    if !self.accept(&frame) {
                        continue;
                    }
                    if out.len() < max_frames {
                        out.push(frame);
                    } else if self.pending.len() < self.config.max_pending {
                        self.pending.push_back(frame);
                    } else {
                        self.counters.overflow_drops += 1;
                    }
                }
                Scan::Dropped => {}
                Scan::NeedMore => break,
            }
        }

        let dropped = self.counters.framing_drops - framing_before;
        if dropped > 0 {
            debug!("dropped {} malformed frame(s) this poll", dropped);
        }
        if self.buffer.len() > self.config.large_backlog && self.backlog_warn.ready() {
            warn!("stream backlog: {} bytes buffered", self.buffer.len());
        }
        out
    }

    /// Like [`StreamIngest::read_batch`], with each payload passed through
    /// `decoder`. Payloads it rejects are counted and skipped.
    pub fn read_decoded<D>(
        &mut self,
        transport: &mut dyn Transport,
        max_samples: usize,
        decoder: &mut D,
    ) -> Vec<D::Sample>
    where
        D: SampleDecoder,
    {
        let frames = self.read_batch(transport, max_samples);
        let mut samples = Vec::with_capacity(frames.len());
        for frame in &frames {
            match decoder.decode(&frame.payload) {
                Some(sample) => samples.push(sample),
                None => self.counters.decode_failures += 1,
            }
        }
        samples
    }

    fn halt(&mut self) {
        self.state = IngestState::Stopped;
        self.stopped_after = self.started_at.map(|t| t.elapsed());
    }

    /// One adaptive-size read appended to the buffer.
    fn fill(&mut self, transport: &mut dyn Transport) {
        let size = self.config.read_size(self.buffer.len());
        let old_len = self.buffer.len();
        self.buffer.resize(old_len + size, 0);
        let result = transport.read(&mut self.buffer[old_len..]);
        match result {
            Ok(n) => {
                self.buffer.truncate(old_len + n);
                self.consecutive_errors = 0;
                if size > self.config.base_read_size {
                    trace!("catch-up read: asked {} got {} (backlog {})", size, n, old_len);
                }
            }
            Err(e) if is_idle_error(&e) => {
                self.buffer.truncate(old_len);
                self.consecutive_errors = 0;
            }
            Err(e) => {
                self.buffer.truncate(old_len);
                self.record_read_error(&e);
            }
        }
    }

    fn record_read_error(&mut self, err: &io::Error) {
        self.counters.read_errors += 1;
        self.consecutive_errors += 1;
        warn!(
            "stream read failed ({} consecutive): {}",
            self.consecutive_errors, err
        );
        if is_fatal(err) || self.consecutive_errors >= self.config.fatal_error_threshold {
            error!("critical transport error, stopping acquisition: {}", err);
            self.halt();
        }
    }

    /// Take the next candidate off the buffer.
    fn scan(&mut self) -> Scan {
        let Some(start) = self.buffer.iter().position(|&b| b == START_MARKER) else {
            if self.buffer.len() > self.config.desync_limit {
                warn!(
                    "no start marker in {} buffered bytes, clearing buffer",
                    self.buffer.len()
                );
                self.counters.desync_resets += 1;
                self.counters.discarded_bytes += self.buffer.len() as u64;
                self.buffer.clear();
            }
            return Scan::NeedMore;
        };

        if start > 0 {
            if start > self.config.garbage_limit {
                warn!("skipping {} bytes of garbage before start marker", start);
            }
            self.counters.discarded_bytes += start as u64;
            self.buffer.drain(..start);
        }
        if self.buffer.len() < FRAME_LEN {
            return Scan::NeedMore;
        }

        match Frame::decode(&self.buffer[..FRAME_LEN]) {
            Ok(frame) => {
                self.buffer.drain(..FRAME_LEN);
                Scan::Frame(frame)
            }
            Err(e) => {
                trace!("dropping candidate frame: {}", e);
                self.counters.framing_drops += 1;
                self.buffer.drain(..1);
                Scan::Dropped
            }
        }
    }

    /// Sequence and progress bookkeeping for a valid frame. False if it is
    /// not a streaming sample.
    fn accept(&mut self, frame: &Frame) -> bool {
        if !frame.classify().is_stream_sample() {
            self.counters.ignored += 1;
            debug!(
                "ignoring non-stream frame during acquisition (code {:#04X})",
                frame.code
            );
            return false;
        }

        let counter = frame.counter();
        if let Some(previous) = self.last_counter {
            let expected = (previous + 1) % SEQUENCE_MODULUS;
            let gap = (counter + SEQUENCE_MODULUS - expected) % SEQUENCE_MODULUS;
            if gap > 0 {
                self.counters.sequence_loss += u64::from(gap);
                self.counters.gap_events += 1;
                if self.loss_log.hit() {
                    warn!(
                        "packet loss: {} dropped (total {}, {} gap events)",
                        gap, self.counters.sequence_loss, self.counters.gap_events
                    );
                }
            }
        }
        self.last_counter = Some(counter);

        self.counters.accepted += 1;
        if self.counters.accepted % self.config.progress_log_every.max(1) == 0 {
            if self.counters.sequence_loss > 0 {
                debug!(
                    "frame #{} (lost: {})",
                    self.counters.accepted, self.counters.sequence_loss
                );
            } else {
                debug!("frame #{}", self.counters.accepted);
            }
        }
        true
    }
}

/// Errors that mean the device is gone rather than momentarily unhappy.
fn is_fatal(err: &io::Error) -> bool {
    // ENXIO and ENODEV are what an unplugged USB serial adapter reports.
    const ENXIO: i32 = 6;
    const ENODEV: i32 = 19;
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
    ) || matches!(err.raw_os_error(), Some(ENXIO) | Some(ENODEV))
        || err.to_string().contains("Device not configured")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockHandle, MockTransport};
    use crate::protocol::{OPCODE_START, PAYLOAD_LEN};
    use pretty_assertions::assert_eq;

    fn sample(seq: u8) -> Frame {
        Frame::stream_sample(seq, [0x40 | seq; PAYLOAD_LEN])
    }

    fn push_samples(handle: &MockHandle, seqs: impl IntoIterator<Item = u8>) {
        for seq in seqs {
            handle.push_frame(&sample(seq));
        }
    }

    fn running() -> (StreamIngest, MockTransport, MockHandle) {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut ingest = StreamIngest::default();
        ingest.start();
        (ingest, transport, handle)
    }

    #[test]
    fn single_gap_counts_one_lost_frame() {
        let (mut ingest, mut transport, handle) = running();
        push_samples(&handle, [0, 1, 3, 4]);

        let frames = ingest.read_batch(&mut transport, 100);
        let counters: Vec<u8> = frames.iter().map(Frame::counter).collect();
        assert_eq!(counters, vec![0, 1, 3, 4]);
        assert_eq!(ingest.loss_stats().sequence_loss, 1);
        assert_eq!(ingest.loss_stats().accepted_count, 4);
    }

    #[test]
    fn counter_wrap_is_not_a_gap() {
        let (mut ingest, mut transport, handle) = running();
        push_samples(&handle, [61, 62, 63, 0, 1]);
        assert_eq!(ingest.read_batch(&mut transport, 100).len(), 5);
        assert_eq!(ingest.loss_stats().sequence_loss, 0);

        // Both jumps count: 1 -> 63 misses 2..=62, then 63 -> 2 misses 0 and 1.
        push_samples(&handle, [63, 2]);
        ingest.read_batch(&mut transport, 100);
        assert_eq!(ingest.loss_stats().sequence_loss, 61 + 2);
    }

    #[test]
    fn markerless_backlog_is_discarded() {
        let (mut ingest, mut transport, handle) = running();
        handle.push_bytes(&vec![0x00; DESYNC_LIMIT + 1]);

        for _ in 0..100 {
            ingest.read_batch(&mut transport, 10);
            if handle.pending_input() == 0 {
                break;
            }
        }
        assert_eq!(handle.pending_input(), 0);
        assert_eq!(ingest.buffered(), 0);
        assert!(ingest.is_running());
        let stats = ingest.loss_stats();
        assert_eq!(stats.desync_resets, 1);
        assert_eq!(stats.discarded_bytes, (DESYNC_LIMIT + 1) as u64);
    }

    #[test]
    fn large_garbage_prefix_is_skipped() {
        let (mut ingest, mut transport, handle) = running();
        handle.push_bytes(&vec![0x00; GARBAGE_LIMIT + 2_000]);
        push_samples(&handle, [7]);

        let mut frames = Vec::new();
        for _ in 0..10 {
            frames.extend(ingest.read_batch(&mut transport, 10));
        }
        assert_eq!(frames, vec![sample(7)]);
        assert_eq!(ingest.loss_stats().discarded_bytes, (GARBAGE_LIMIT + 2_000) as u64);
    }

    #[test]
    fn partial_frame_waits_for_the_rest() {
        let (mut ingest, mut transport, handle) = running();
        let second = sample(1).to_bytes();
        handle.push_frame(&sample(0));
        handle.push_bytes(&second[..10]);

        assert_eq!(ingest.read_batch(&mut transport, 10), vec![sample(0)]);
        assert_eq!(ingest.buffered(), 10);

        handle.push_bytes(&second[10..]);
        assert_eq!(ingest.read_batch(&mut transport, 10), vec![sample(1)]);
        assert_eq!(ingest.buffered(), 0);
    }

    #[test]
    fn bad_end_marker_drops_only_the_false_start() {
        let (mut ingest, mut transport, handle) = running();
        let mut broken = sample(0).to_bytes();
        broken[FRAME_LEN - 1] = 0x00;
        handle.push_bytes(&broken);
        push_samples(&handle, [1]);

        assert_eq!(ingest.read_batch(&mut transport, 10), vec![sample(1)]);
        assert_eq!(ingest.loss_stats().framing_drops, 1);
    }

    #[test]
    fn acks_are_not_samples() {
        let (mut ingest, mut transport, handle) = running();
        handle.push_frame(&sample(0));
        handle.push_frame(&Frame::ack(9, OPCODE_START));
        handle.push_frame(&sample(1));

        let frames = ingest.read_batch(&mut transport, 10);
        assert_eq!(frames, vec![sample(0), sample(1)]);
        assert_eq!(ingest.loss_stats().sequence_loss, 0);
    }

    #[test]
    fn consecutive_failures_stop_the_reader() {
        let (mut ingest, mut transport, handle) = running();
        handle.fail_reads(FATAL_ERROR_THRESHOLD as usize - 1, io::ErrorKind::Other);
        for _ in 0..FATAL_ERROR_THRESHOLD - 1 {
            assert!(ingest.read_batch(&mut transport, 10).is_empty());
        }
        assert!(ingest.is_running());

        handle.fail_reads(1, io::ErrorKind::Other);
        assert!(ingest.read_batch(&mut transport, 10).is_empty());
        assert!(!ingest.is_running());
        assert_eq!(ingest.state(), IngestState::Stopped);
        assert_eq!(ingest.loss_stats().read_errors, u64::from(FATAL_ERROR_THRESHOLD));

        // Stopped readers do not touch the transport.
        push_samples(&handle, [0]);
        assert!(ingest.read_batch(&mut transport, 10).is_empty());
        assert_eq!(handle.pending_input(), FRAME_LEN);
    }

    #[test]
    fn a_good_read_resets_the_error_run() {
        let (mut ingest, mut transport, handle) = running();
        handle.fail_reads(FATAL_ERROR_THRESHOLD as usize - 1, io::ErrorKind::Other);
        for _ in 0..FATAL_ERROR_THRESHOLD - 1 {
            ingest.read_batch(&mut transport, 10);
        }
        ingest.read_batch(&mut transport, 10);
        handle.fail_reads(FATAL_ERROR_THRESHOLD as usize - 1, io::ErrorKind::Other);
        for _ in 0..FATAL_ERROR_THRESHOLD - 1 {
            ingest.read_batch(&mut transport, 10);
        }
        assert!(ingest.is_running());
    }

    #[test]
    fn unplugged_device_stops_immediately() {
        let (mut ingest, mut transport, handle) = running();
        handle.fail_next_read(io::Error::from_raw_os_error(6));
        ingest.read_batch(&mut transport, 10);
        assert!(!ingest.is_running());

        let (mut ingest, mut transport, handle) = running();
        handle.fail_next_read(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        ingest.read_batch(&mut transport, 10);
        assert!(!ingest.is_running());
    }

    #[test]
    fn frames_beyond_the_limit_carry_over() {
        let (mut ingest, mut transport, handle) = running();
        push_samples(&handle, 0..10);

        assert_eq!(ingest.read_batch(&mut transport, 4).len(), 4);
        assert_eq!(ingest.pending(), 6);
        let next = ingest.read_batch(&mut transport, 4);
        assert_eq!(next.first().map(Frame::counter), Some(4));
        assert_eq!(next.len(), 4);
        assert_eq!(ingest.read_batch(&mut transport, 4).len(), 2);
        assert_eq!(ingest.loss_stats().sequence_loss, 0);
    }

    #[test]
    fn carry_over_queue_is_bounded() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        let mut ingest = StreamIngest::new(IngestConfig {
            max_pending: 3,
            ..IngestConfig::default()
        });
        ingest.start();
        push_samples(&handle, 0..10);

        assert_eq!(ingest.read_batch(&mut transport, 2).len(), 2);
        assert_eq!(ingest.pending(), 3);
        assert_eq!(ingest.loss_stats().overflow_drops, 5);
    }

    #[test]
    fn read_size_grows_with_backlog() {
        let config = IngestConfig::default();
        assert_eq!(config.read_size(0), BASE_READ_SIZE);
        assert_eq!(config.read_size(MEDIUM_BACKLOG), BASE_READ_SIZE);
        assert_eq!(config.read_size(MEDIUM_BACKLOG + 1), MEDIUM_READ_SIZE);
        assert_eq!(config.read_size(LARGE_BACKLOG + 1), LARGE_READ_SIZE);
    }

    #[test]
    fn not_started_reads_nothing() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        push_samples(&handle, [0]);
        let mut ingest = StreamIngest::default();

        assert!(ingest.read_batch(&mut transport, 10).is_empty());
        assert_eq!(ingest.state(), IngestState::NotStarted);
        assert_eq!(handle.pending_input(), FRAME_LEN);
    }

    #[test]
    fn stop_reports_and_restart_resets() {
        let (mut ingest, mut transport, handle) = running();
        push_samples(&handle, [0, 5]);
        ingest.read_batch(&mut transport, 10);

        let stats = ingest.stop();
        assert_eq!(stats.accepted_count, 2);
        assert_eq!(stats.sequence_loss, 4);
        assert_eq!(ingest.state(), IngestState::Stopped);
        assert_eq!(ingest.loss_stats().elapsed_ms, stats.elapsed_ms);

        ingest.start();
        assert_eq!(ingest.loss_stats().accepted_count, 0);
        assert_eq!(ingest.loss_stats().sequence_loss, 0);
    }

    #[test]
    fn decoder_failures_are_counted() {
        let (mut ingest, mut transport, handle) = running();
        push_samples(&handle, 0..6);

        let mut decoder = |payload: &Payload| Some(payload[0] & 0x3F);
        let samples = ingest.read_decoded(&mut transport, 10, &mut decoder);
        assert_eq!(samples, vec![0, 1, 2, 3, 4, 5]);

        push_samples(&handle, 6..9);
        let mut reject_all = |_: &Payload| None::<u8>;
        assert!(ingest.read_decoded(&mut transport, 10, &mut reject_all).is_empty());
        assert_eq!(ingest.loss_stats().decode_failures, 3);
    }

    #[test]
    fn throughput_estimate() {
        assert_eq!(
            LossStats::throughput_estimate(500, 400, Duration::from_secs(1)),
            (500, 100, 20.0)
        );
        assert_eq!(
            LossStats::throughput_estimate(500, 600, Duration::from_secs(1)),
            (500, 0, 0.0)
        );
        assert_eq!(
            LossStats::throughput_estimate(500, 0, Duration::ZERO),
            (0, 0, 0.0)
        );
    }

    #[test]
    fn stats_accept_partial_json() {
        let stats: LossStats =
            serde_json::from_str(r#"{"accepted_count": 12, "sequence_loss": 1}"#).unwrap();
        assert_eq!(stats.accepted_count, 12);
        assert_eq!(stats.sequence_loss, 1);
        assert_eq!(stats.read_errors, 0);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["throughput_loss_percent"], 0.0);
    }
}
