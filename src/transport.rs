//! Byte transports the monitor can talk over.
//!
//! [`Transport`] is the capability the rest of the crate needs from a port:
//! blocking reads bounded by a timeout, writes, input/output flushing and an
//! explicit close. Which implementation is used is decided at construction:
//! [`SerialTransport`] for hardware, [`NullTransport`] when there is none, and
//! the scripted `MockTransport` in tests.

use std::collections::HashSet;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;
use serialport::{ClearBuffer, SerialPort};

use crate::errors::Result;

/// Default serial baud rate of the monitor.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Read timeout used while streaming.
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Transport Abstraction
// ============================================================================

pub trait Transport: Read + Write + Send {
    /// Discard bytes received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Discard bytes written but not yet transmitted.
    fn clear_output(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Change the per-call read/write timeout.
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    /// Release the endpoint. Reads and writes fail afterwards.
    fn close(&mut self) -> io::Result<()>;

    fn is_open(&self) -> bool;
}

/// Opens endpoints by name. Port probing goes through this so it can run
/// against real ports or scripted ones.
pub trait Connector {
    fn open(&self, endpoint: &str, baud_rate: u32, timeout: Duration)
        -> Result<Box<dyn Transport>>;
}

/// True for read errors that only mean "nothing arrived yet".
pub(crate) fn is_idle_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Read whatever is available into `buf`, treating a timeout as zero bytes.
pub(crate) fn read_available(transport: &mut dyn Transport, buf: &mut [u8]) -> io::Result<usize> {
    match transport.read(buf) {
        Ok(n) => Ok(n),
        Err(e) if is_idle_error(&e) => Ok(0),
        Err(e) => Err(e),
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "port is closed")
}

// ============================================================================
// Serial
// ============================================================================

/// A serial port opened through the `serialport` crate.
pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn open(name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(name, baud_rate).timeout(timeout).open()?;
        debug!(
            "opened serial port: name={}, baud={}, timeout={:?}",
            name, baud_rate, timeout
        );
        Ok(Self {
            name: name.to_string(),
            port: Some(port),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(closed_error)
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port()?.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port()?.flush()
    }
}

impl Transport for SerialTransport {
    fn clear_input(&mut self) -> io::Result<()> {
        self.port()?.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn clear_output(&mut self) -> io::Result<()> {
        self.port()?.clear(ClearBuffer::Output).map_err(io::Error::from)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port()?.set_timeout(timeout).map_err(io::Error::from)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("closed serial port: name={}", self.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

/// Connector for real serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(
        &self,
        endpoint: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(endpoint, baud_rate, timeout)?))
    }
}

// ============================================================================
// Null
// ============================================================================

/// Transport for running without hardware: writes are discarded and reads
/// time out immediately.
#[derive(Debug)]
pub struct NullTransport {
    open: bool,
}

impl Default for NullTransport {
    fn default() -> Self {
        Self { open: true }
    }
}

impl Read for NullTransport {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Err(closed_error());
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "no device"))
    }
}

impl Write for NullTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(closed_error());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for NullTransport {
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

// ============================================================================
// Port enumeration
// ============================================================================

/// Sort key so that ttyACM* ports come first, then ttyUSB* (both numerically),
/// then everything else by name.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        return (0, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        return (1, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("COM") {
        if let Ok(n) = rest.parse() {
            return (2, n, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// Candidate endpoints for port probing, in a deterministic order.
pub fn list_ports() -> Vec<String> {
    let mut names: HashSet<String> = HashSet::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                names.insert(info.port_name);
            }
        }
        Err(e) => debug!("serial port enumeration failed: {}", e),
    }

    // USB CDC/serial adapters are not always reported by the enumerator.
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    names.insert(format!("/dev/{fname}"));
                }
            }
        }
    }

    let mut ports: Vec<String> = names.into_iter().collect();
    ports.sort_by_key(|p| port_sort_key(p));
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_sort_acm_then_usb_then_com() {
        let mut ports = vec![
            "/dev/ttyS0".to_string(),
            "COM10".to_string(),
            "/dev/ttyUSB1".to_string(),
            "/dev/ttyACM10".to_string(),
            "COM3".to_string(),
            "/dev/ttyACM2".to_string(),
            "/dev/ttyUSB0".to_string(),
        ];
        ports.sort_by_key(|p| port_sort_key(p));
        assert_eq!(
            ports,
            vec![
                "/dev/ttyACM2",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "COM3",
                "COM10",
                "/dev/ttyS0",
            ]
        );
    }

    #[test]
    fn null_transport_times_out_and_closes() {
        let mut null = NullTransport::default();
        let mut buf = [0u8; 8];
        assert_eq!(read_available(&mut null, &mut buf).unwrap(), 0);
        assert_eq!(null.write(&[1, 2, 3]).unwrap(), 3);

        null.close().unwrap();
        assert!(!null.is_open());
        let err = null.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn idle_errors_are_not_failures() {
        assert!(is_idle_error(&io::Error::new(io::ErrorKind::TimedOut, "t")));
        assert!(!is_idle_error(&io::Error::new(io::ErrorKind::BrokenPipe, "b")));
    }
}
