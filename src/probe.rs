//! Port probing: find which endpoint the monitor is attached to.
//!
//! Candidates are tried one after another. Each is opened with a short
//! timeout, flushed, and sent a START; the first endpoint that acknowledges
//! is kept open and handed back, every other one is closed before moving on.
//! Worst case the scan takes `candidates × per_port_timeout`.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};

use crate::protocol::Command;
use crate::session::{CommandSession, SessionConfig};
use crate::transport::{Connector, Transport, DEFAULT_BAUD_RATE};

/// Default time to wait for a START acknowledgement on each candidate.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(150);

/// The endpoint that answered, with its transport still open.
pub struct ProbeHit {
    pub endpoint: String,
    pub transport: Box<dyn Transport>,
}

impl fmt::Debug for ProbeHit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeHit")
            .field("endpoint", &self.endpoint)
            .field("open", &self.transport.is_open())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PortProbe {
    pub baud_rate: u32,
    pub per_port_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for PortProbe {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            per_port_timeout: PROBE_TIMEOUT,
            session: SessionConfig::default(),
        }
    }
}

impl PortProbe {
    pub fn new(baud_rate: u32, per_port_timeout: Duration) -> Self {
        Self {
            baud_rate,
            per_port_timeout,
            ..Self::default()
        }
    }

    /// Try each candidate in order and return the first that acknowledges
    /// START, or `None` if none does. Endpoints after the match are not tried.
    pub fn scan<C>(&self, connector: &C, candidates: &[String]) -> Option<ProbeHit>
    where
        C: Connector + ?Sized,
    {
        if candidates.is_empty() {
            warn!("port probe: no candidate ports");
            return None;
        }
        info!(
            "port probe: {} candidate(s): {}",
            candidates.len(),
            candidates.join(", ")
        );

        for endpoint in candidates {
            if let Some(transport) = self.try_endpoint(connector, endpoint) {
                info!("port probe: device found on {}", endpoint);
                return Some(ProbeHit {
                    endpoint: endpoint.clone(),
                    transport,
                });
            }
        }

        warn!("port probe: no port acknowledged START");
        None
    }

    fn try_endpoint<C>(&self, connector: &C, endpoint: &str) -> Option<Box<dyn Transport>>
    where
        C: Connector + ?Sized,
    {
        debug!("port probe: testing {}", endpoint);
        let mut transport = match connector.open(endpoint, self.baud_rate, self.per_port_timeout) {
            Ok(t) => t,
            Err(e) => {
                debug!("port probe: cannot open {}: {}", endpoint, e);
                return None;
            }
        };

        if self.identify(&mut *transport, endpoint) {
            return Some(transport);
        }
        if let Err(e) = transport.close() {
            debug!("port probe: error closing {}: {}", endpoint, e);
        }
        None
    }

    fn identify(&self, transport: &mut dyn Transport, endpoint: &str) -> bool {
        if let Err(e) = transport.clear_input() {
            debug!("port probe: cannot flush {}: {}", endpoint, e);
            return false;
        }
        if let Err(e) = transport.clear_output() {
            debug!("port probe: cannot flush {}: {}", endpoint, e);
            return false;
        }

        let mut session = CommandSession::new(self.session.clone());
        session.set_quiet(true);
        match session.request(transport, Command::Start, self.per_port_timeout) {
            Ok(_) => true,
            Err(e) => {
                debug!("port probe: {} did not acknowledge START: {}", endpoint, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockDevice, MockTransport};
    use pretty_assertions::assert_eq;

    fn fast_probe() -> PortProbe {
        PortProbe {
            per_port_timeout: Duration::from_millis(30),
            session: SessionConfig {
                poll_interval: Duration::from_millis(1),
                ..SessionConfig::default()
            },
            ..PortProbe::default()
        }
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("COM{i}")).collect()
    }

    fn connector_with_device_at(n: usize, k: usize) -> MockConnector {
        (0..n).fold(MockConnector::new(), |c, i| {
            let device = if i == k {
                MockDevice::new()
            } else {
                MockDevice::silent()
            };
            c.with_endpoint(&format!("COM{i}"), device.into_transport())
        })
    }

    #[test]
    fn only_acknowledging_port_stays_open() {
        let connector = connector_with_device_at(5, 2);
        let hit = fast_probe().scan(&connector, &names(5)).expect("device found");

        assert_eq!(hit.endpoint, "COM2");
        assert!(hit.transport.is_open());
        assert!(!connector.handle("COM0").unwrap().is_open());
        assert!(!connector.handle("COM1").unwrap().is_open());
        // Short-circuits after the match.
        assert_eq!(connector.opened(), vec!["COM0", "COM1", "COM2"]);
        assert!(connector.handle("COM3").unwrap().is_open());
        assert_eq!(
            connector.handle("COM2").unwrap().written_commands(),
            vec![Command::Start]
        );
    }

    #[test]
    fn no_answer_means_none_and_everything_closed() {
        let connector = connector_with_device_at(3, usize::MAX);
        assert!(fast_probe().scan(&connector, &names(3)).is_none());
        for name in names(3) {
            assert!(!connector.handle(&name).unwrap().is_open(), "{name}");
        }
    }

    #[test]
    fn unopenable_ports_are_skipped() {
        let connector = MockConnector::new()
            .with_endpoint("/dev/ttyUSB1", MockDevice::new().into_transport());
        let candidates = vec!["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()];
        let hit = fast_probe().scan(&connector, &candidates).unwrap();
        assert_eq!(hit.endpoint, "/dev/ttyUSB1");
    }

    #[test]
    fn stale_input_is_flushed_and_timeout_applied() {
        let transport = MockDevice::new().ack_with_stream_code().into_transport();
        let handle = transport.handle();
        handle.push_bytes(&[0xE8, 0x00, 0x11]);
        let connector = MockConnector::new().with_endpoint("COM7", transport);

        let probe = fast_probe();
        let hit = probe.scan(&connector, &["COM7".to_string()]).unwrap();
        assert_eq!(hit.endpoint, "COM7");
        assert_eq!(handle.clear_input_calls(), 1);
        assert_eq!(handle.timeout(), Some(probe.per_port_timeout));
    }

    #[test]
    fn empty_candidate_list() {
        let connector = MockConnector::new().with_endpoint("COM1", MockTransport::new());
        assert!(fast_probe().scan(&connector, &[]).is_none());
        assert!(connector.opened().is_empty());
    }
}
