//! End-to-end acquisition against scripted devices: probe, stream with
//! noise and gaps, query the version mid-stream, tear down.

use std::time::Duration;

use _core::mock::{MockConnector, MockDevice};
use _core::protocol::{Frame, Payload, PAYLOAD_LEN};
use _core::{Command, EcgMonitor, LinkConfig, LinkState};
use pretty_assertions::assert_eq;

fn fast_config() -> LinkConfig {
    LinkConfig {
        response_timeout_ms: 200,
        probe_timeout_ms: 30,
        stream_read_timeout_ms: 5,
        poll_interval_ms: 1,
        ..LinkConfig::default()
    }
}

fn sample(seq: u8) -> Frame {
    let mut payload = [0u8; PAYLOAD_LEN];
    payload[0] = 0x40 | seq;
    payload[1] = seq;
    Frame::stream_sample(seq, payload)
}

#[test]
fn probe_stream_and_close() {
    let candidates: Vec<String> = ["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyUSB0"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let connector = MockConnector::new()
        .with_endpoint("/dev/ttyACM0", MockDevice::silent().into_transport())
        .with_endpoint(
            "/dev/ttyACM1",
            MockDevice::new().version("ECG-500 r3").into_transport(),
        )
        .with_endpoint("/dev/ttyUSB0", MockDevice::new().into_transport());

    let mut monitor = EcgMonitor::probe_with(&connector, &candidates, fast_config())
        .expect("probe runs")
        .expect("monitor found");
    assert_eq!(monitor.endpoint(), "/dev/ttyACM1");
    assert!(!connector.handle("/dev/ttyACM0").unwrap().is_open());
    assert_eq!(connector.opened(), vec!["/dev/ttyACM0", "/dev/ttyACM1"]);

    let device = connector.handle("/dev/ttyACM1").unwrap();
    monitor.start_streaming().unwrap();
    assert_eq!(monitor.state(), LinkState::Streaming);

    // Line noise, a clean run, a torn frame and a gap of two.
    device.push_bytes(&[0x00, 0x13, 0x37]);
    for seq in 0..5 {
        device.push_frame(&sample(seq));
    }
    let torn = sample(5).to_bytes();
    device.push_bytes(&torn[..12]);

    let first = monitor.read_batch(64);
    assert_eq!(first.len(), 5);
    device.push_bytes(&torn[12..]);
    for seq in 8..12 {
        device.push_frame(&sample(seq));
    }
    let second = monitor.read_batch(64);
    let counters: Vec<u8> = second.iter().map(Frame::counter).collect();
    assert_eq!(counters, vec![5, 8, 9, 10, 11]);

    let stats = monitor.loss_stats();
    assert_eq!(stats.accepted_count, 10);
    assert_eq!(stats.sequence_loss, 2);
    assert_eq!(stats.discarded_bytes, 3);

    // Decoded reads through a closure.
    for seq in 12..16 {
        device.push_frame(&sample(seq));
    }
    let mut decode = |payload: &Payload| Some(u16::from(payload[1]));
    assert_eq!(monitor.read_samples(64, &mut decode), vec![12, 13, 14, 15]);

    // The version query stops the device first.
    let version = monitor.version().unwrap();
    assert_eq!(version.text, "ECG-500 r3");
    assert_eq!(monitor.state(), LinkState::Idle);

    monitor.start_streaming().unwrap();
    let stats = monitor.stop_streaming();
    assert_eq!(stats.accepted_count, 0);
    monitor.close().unwrap();

    assert_eq!(
        device.written_commands(),
        vec![
            Command::Start,
            Command::Stop,
            Command::VersionQuery,
            Command::Start,
            Command::Stop,
            Command::Close,
        ]
    );
    assert!(!device.is_open());
    assert!(connector.handle("/dev/ttyUSB0").unwrap().is_open());
}

#[test]
fn unplugged_device_is_reported_through_running() {
    let connector =
        MockConnector::new().with_endpoint("COM4", MockDevice::new().into_transport());
    let mut monitor = EcgMonitor::probe_with(&connector, &["COM4".to_string()], fast_config())
        .unwrap()
        .unwrap();
    let device = connector.handle("COM4").unwrap();

    monitor.start_streaming().unwrap();
    device.push_frame(&sample(0));
    assert_eq!(monitor.read_batch(10).len(), 1);

    device.fail_reads(20, std::io::ErrorKind::Other);
    for _ in 0..20 {
        assert!(monitor.read_batch(10).is_empty());
    }
    assert!(!monitor.is_running());
    assert_eq!(monitor.loss_stats().read_errors, 20);

    // The link itself is still usable for teardown.
    monitor.close().unwrap();
    assert_eq!(monitor.state(), LinkState::Closed);
}

#[test]
fn probing_gives_up_quietly() {
    let connector = MockConnector::new()
        .with_endpoint("COM1", MockDevice::silent().into_transport())
        .with_endpoint("COM2", MockDevice::silent().into_transport());
    let names = vec!["COM1".to_string(), "COM2".to_string(), "COM3".to_string()];

    let started = std::time::Instant::now();
    let found = EcgMonitor::probe_with(&connector, &names, fast_config()).unwrap();
    assert!(found.is_none());
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert!(!connector.handle("COM1").unwrap().is_open());
    assert!(!connector.handle("COM2").unwrap().is_open());
}
