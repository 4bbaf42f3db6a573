//! Python bindings: the `_core` extension module.

use std::time::Duration;

use log::debug;
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::device::{EcgMonitor, LinkConfig};
use crate::errors::DriverError;
use crate::ingest::{LossStats, NOMINAL_RATE_HZ};
use crate::logging;
use crate::protocol::{hex, Command, Frame, Payload, Response, FRAME_LEN};
use crate::transport::{self, DEFAULT_BAUD_RATE};

fn to_py_err(err: DriverError) -> PyErr {
    match err {
        DriverError::Timeout { .. } => PyErr::new::<PyTimeoutError, _>(err.to_string()),
        DriverError::Io(_) | DriverError::Serial(_) => PyErr::new::<PyIOError, _>(err.to_string()),
        _ => PyErr::new::<PyRuntimeError, _>(err.to_string()),
    }
}

fn seconds(value: f64) -> PyResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| PyErr::new::<PyValueError, _>(format!("invalid timeout {value}: {e}")))
}

// ============================================================================
// Frame
// ============================================================================

/// One accepted 22-byte frame.
///
/// Attributes:
///     sequence: Raw sequence byte; `counter` is its 6-bit value (0-63).
///     code: Frame code (0x20 for streaming samples).
///     payload: The 16 payload bytes, undecoded.
#[pyclass(name = "Frame", frozen, eq)]
#[derive(Clone, PartialEq, Eq)]
struct PyFrame {
    #[pyo3(get)]
    sequence: u8,
    #[pyo3(get)]
    code: u8,
    inner: Frame,
}

#[pymethods]
impl PyFrame {
    #[getter]
    fn counter(&self) -> u8 {
        self.inner.counter()
    }

    #[getter]
    fn payload<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, &self.inner.payload)
    }

    /// The frame exactly as it was on the wire.
    fn raw<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, &self.inner.to_bytes())
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("sequence", self.sequence)?;
        dict.set_item("counter", self.inner.counter())?;
        dict.set_item("code", self.code)?;
        dict.set_item("payload", PyBytes::new(py, &self.inner.payload))?;
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        format!(
            "Frame(counter={}, code={:#04X}, payload={})",
            self.inner.counter(),
            self.code,
            hex(&self.inner.payload)
        )
    }
}

impl From<Frame> for PyFrame {
    fn from(frame: Frame) -> Self {
        PyFrame {
            sequence: frame.sequence,
            code: frame.code,
            inner: frame,
        }
    }
}

// ============================================================================
// LossStats
// ============================================================================

/// Loss accounting for one streaming session.
///
/// `sequence_loss` is derived from counter gaps; `throughput_loss` compares
/// the accepted count with 500 Hz times the elapsed time. They are separate
/// estimates and are not reconciled.
#[pyclass(name = "LossStats", frozen)]
#[derive(Clone)]
struct PyLossStats {
    inner: LossStats,
}

#[pymethods]
impl PyLossStats {
    #[getter]
    fn accepted_count(&self) -> u64 {
        self.inner.accepted_count
    }

    #[getter]
    fn sequence_loss(&self) -> u64 {
        self.inner.sequence_loss
    }

    #[getter]
    fn expected_count(&self) -> u64 {
        self.inner.expected_count
    }

    #[getter]
    fn throughput_loss(&self) -> u64 {
        self.inner.throughput_loss
    }

    #[getter]
    fn throughput_loss_percent(&self) -> f64 {
        self.inner.throughput_loss_percent
    }

    #[getter]
    fn elapsed_ms(&self) -> u64 {
        self.inner.elapsed_ms
    }

    #[getter]
    fn framing_drops(&self) -> u64 {
        self.inner.framing_drops
    }

    #[getter]
    fn read_errors(&self) -> u64 {
        self.inner.read_errors
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let s = &self.inner;
        let dict = PyDict::new(py);
        dict.set_item("accepted_count", s.accepted_count)?;
        dict.set_item("sequence_loss", s.sequence_loss)?;
        dict.set_item("expected_count", s.expected_count)?;
        dict.set_item("throughput_loss", s.throughput_loss)?;
        dict.set_item("throughput_loss_percent", s.throughput_loss_percent)?;
        dict.set_item("elapsed_ms", s.elapsed_ms)?;
        dict.set_item("framing_drops", s.framing_drops)?;
        dict.set_item("desync_resets", s.desync_resets)?;
        dict.set_item("discarded_bytes", s.discarded_bytes)?;
        dict.set_item("read_errors", s.read_errors)?;
        dict.set_item("overflow_drops", s.overflow_drops)?;
        dict.set_item("decode_failures", s.decode_failures)?;
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        let s = &self.inner;
        format!(
            "LossStats(accepted={}, sequence_loss={}, throughput_loss={} ({:.2}%))",
            s.accepted_count, s.sequence_loss, s.throughput_loss, s.throughput_loss_percent
        )
    }
}

impl From<LossStats> for PyLossStats {
    fn from(inner: LossStats) -> Self {
        PyLossStats { inner }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Link to an ECG monitor.
///
/// Example:
///     >>> monitor = Monitor.probe()
///     >>> monitor.start()
///     >>> frames = monitor.read(64)
///     >>> stats = monitor.stop()
///     >>> monitor.close()
#[pyclass(name = "Monitor", unsendable)]
struct PyMonitor {
    inner: EcgMonitor,
}

#[pymethods]
impl PyMonitor {
    /// Open a known serial port without probing.
    #[new]
    #[pyo3(signature = (path, baud=115_200))]
    fn new(path: &str, baud: u32) -> PyResult<Self> {
        Self::open(path, baud)
    }

    #[staticmethod]
    #[pyo3(signature = (path, baud=115_200))]
    fn open(path: &str, baud: u32) -> PyResult<Self> {
        let config = LinkConfig {
            baud_rate: baud,
            ..LinkConfig::default()
        };
        EcgMonitor::open(path, config)
            .map(|inner| PyMonitor { inner })
            .map_err(to_py_err)
    }

    /// Try each candidate port (default: every port found) and open the
    /// first that acknowledges START. Returns None if none does.
    #[staticmethod]
    #[pyo3(signature = (candidates=None, baud=115_200, probe_timeout_ms=150))]
    fn probe(candidates: Option<Vec<String>>, baud: u32, probe_timeout_ms: u64) -> PyResult<Option<Self>> {
        let candidates = candidates.unwrap_or_else(transport::list_ports);
        let config = LinkConfig {
            baud_rate: baud,
            probe_timeout_ms,
            ..LinkConfig::default()
        };
        EcgMonitor::probe_and_open(&candidates, config)
            .map(|found| found.map(|inner| PyMonitor { inner }))
            .map_err(to_py_err)
    }

    /// A monitor with no hardware behind it.
    #[staticmethod]
    fn null() -> Self {
        PyMonitor {
            inner: EcgMonitor::null(LinkConfig::default()),
        }
    }

    /// Send one command ("start", "stop", "version", "close") and return the
    /// reply as a dict.
    ///
    /// Raises:
    ///     ValueError: unknown command name
    ///     TimeoutError: no reply within `timeout` seconds
    #[pyo3(signature = (name, timeout=2.0))]
    fn command<'py>(&mut self, py: Python<'py>, name: &str, timeout: f64) -> PyResult<Bound<'py, PyDict>> {
        let command = Command::from_name(name)
            .ok_or_else(|| PyErr::new::<PyValueError, _>(format!("unknown command: {name}")))?;
        let response = self
            .inner
            .command(command, seconds(timeout)?)
            .map_err(to_py_err)?;

        let dict = PyDict::new(py);
        match response {
            Response::Ack { opcode } => {
                dict.set_item("kind", "ack")?;
                dict.set_item("opcode", opcode)?;
            }
            Response::VersionData { payload } => {
                dict.set_item("kind", "version_data")?;
                dict.set_item("payload", PyBytes::new(py, &payload))?;
            }
            Response::StreamSample { payload } => {
                dict.set_item("kind", "stream_sample")?;
                dict.set_item("payload", PyBytes::new(py, &payload))?;
            }
            Response::Unknown { code } => {
                dict.set_item("kind", "unknown")?;
                dict.set_item("code", code)?;
            }
        }
        Ok(dict)
    }

    /// Firmware version text. Ends a running stream first.
    fn version(&mut self) -> PyResult<String> {
        self.inner.version().map(|v| v.text).map_err(to_py_err)
    }

    fn start(&mut self) -> PyResult<()> {
        self.inner.start_streaming().map_err(to_py_err)
    }

    /// Stop streaming and return the session's loss statistics.
    fn stop(&mut self) -> PyLossStats {
        self.inner.stop_streaming().into()
    }

    /// Up to `n_frames` accepted frames. Never raises on transport faults;
    /// check `running` instead.
    #[pyo3(signature = (n_frames=100))]
    fn read(&mut self, n_frames: usize) -> Vec<PyFrame> {
        self.inner
            .read_batch(n_frames)
            .into_iter()
            .map(PyFrame::from)
            .collect()
    }

    /// Like `read`, with each 16-byte payload passed to `decoder`. Payloads
    /// for which it returns None or raises are counted and skipped.
    #[pyo3(signature = (decoder, n_frames=100))]
    fn read_decoded(&mut self, py: Python<'_>, decoder: Bound<'_, PyAny>, n_frames: usize) -> Vec<Py<PyAny>> {
        let mut decode = |payload: &Payload| match decoder.call1((PyBytes::new(py, payload),)) {
            Ok(value) if !value.is_none() => Some(value.unbind()),
            Ok(_) => None,
            Err(e) => {
                debug!("sample decoder raised: {}", e);
                None
            }
        };
        self.inner.read_samples(n_frames, &mut decode)
    }

    #[getter]
    fn loss_stats(&self) -> PyLossStats {
        self.inner.loss_stats().into()
    }

    #[getter]
    fn running(&self) -> bool {
        self.inner.is_running()
    }

    #[getter]
    fn state(&self) -> &'static str {
        self.inner.state().name()
    }

    #[getter]
    fn endpoint(&self) -> String {
        self.inner.endpoint().to_string()
    }

    fn close(&mut self) -> PyResult<()> {
        self.inner.close().map_err(to_py_err)
    }

    fn __enter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    #[pyo3(signature = (_exc_type=None, _exc_value=None, _traceback=None))]
    fn __exit__(
        &mut self,
        _exc_type: Option<Bound<'_, PyAny>>,
        _exc_value: Option<Bound<'_, PyAny>>,
        _traceback: Option<Bound<'_, PyAny>>,
    ) -> PyResult<bool> {
        self.close()?;
        Ok(false)
    }

    fn __repr__(&self) -> String {
        format!(
            "Monitor(endpoint={:?}, state={})",
            self.inner.endpoint(),
            self.inner.state()
        )
    }
}

// ============================================================================
// Module
// ============================================================================

/// Candidate serial ports, most likely first.
#[pyfunction(name = "list_ports")]
fn py_list_ports() -> Vec<String> {
    transport::list_ports()
}

/// Change the level of records forwarded to Python's `logging`
/// (None re-reads `ECG_LOG` / `RUST_LOG`).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;

    m.add_class::<PyMonitor>()?;
    m.add_class::<PyFrame>()?;
    m.add_class::<PyLossStats>()?;
    m.add_function(wrap_pyfunction!(py_list_ports, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("NOMINAL_RATE_HZ", NOMINAL_RATE_HZ)?;
    m.add("FRAME_LEN", FRAME_LEN)?;
    m.add("DEFAULT_BAUD_RATE", DEFAULT_BAUD_RATE)?;

    Ok(())
}
