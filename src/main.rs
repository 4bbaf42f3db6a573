use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use _core::logging::init_rust_logging;
use _core::protocol::hex;
use _core::transport::DEFAULT_BAUD_RATE;
use _core::{list_ports, EcgMonitor, LinkConfig};

#[derive(Parser, Debug)]
#[command(
    name = "ecg-link",
    about = "Find an ECG monitor, stream a few batches and report loss"
)]
struct Args {
    /// Serial port to use instead of probing (e.g. /dev/ttyACM0, COM3)
    #[arg(long)]
    port: Option<String>,
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    /// Per-port wait for a START acknowledgement while probing
    #[arg(long, default_value_t = 150)]
    probe_timeout_ms: u64,
    /// Number of batches to read
    #[arg(long, default_value_t = 10)]
    batches: usize,
    /// Pause between batches
    #[arg(long, default_value_t = 33)]
    tick_ms: u64,
    /// Most frames taken per batch
    #[arg(long, default_value_t = 100)]
    max_frames: usize,
    /// Query the firmware version before streaming
    #[arg(long = "version")]
    query_version: bool,
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = LinkConfig {
        baud_rate: args.baud,
        probe_timeout_ms: args.probe_timeout_ms,
        ..LinkConfig::default()
    };

    // 1. Connection
    let mut monitor = match &args.port {
        Some(port) => {
            EcgMonitor::open(port, config).with_context(|| format!("failed to open {port}"))?
        }
        None => {
            let candidates = list_ports();
            if candidates.is_empty() {
                bail!("no serial ports found");
            }
            println!("Probing {} port(s): {}", candidates.len(), candidates.join(", "));
            EcgMonitor::probe_and_open(&candidates, config)
                .context("port probe failed")?
                .ok_or_else(|| anyhow!("no port acknowledged START"))?
        }
    };
    println!("Connected on {}", monitor.endpoint());

    if args.query_version {
        match monitor.version() {
            Ok(v) => println!("Version: {} [{}]", v.text, v.hex()),
            Err(e) => println!("Version: unknown ({e})"),
        }
    }

    // 2. Acquisition
    monitor.start_streaming().context("failed to start streaming")?;
    println!("Reading {} batches every {} ms...", args.batches, args.tick_ms);
    let tick = Duration::from_millis(args.tick_ms);
    for i in 0..args.batches {
        thread::sleep(tick);
        let frames = monitor.read_batch(args.max_frames);
        match frames.first() {
            Some(first) => println!(
                "[Batch {}] {:3} frames | Seq: {:02} | Payload: {}",
                i,
                frames.len(),
                first.counter(),
                hex(&first.payload)
            ),
            None => println!("[Batch {i}] no data"),
        }
        if !monitor.is_running() {
            eprintln!("Acquisition stopped after a transport failure");
            break;
        }
    }

    // 3. Cleanup
    println!("Stopping...");
    let stats = monitor.stop_streaming();
    println!(
        "Accepted {} of ~{} expected frames ({} lost, {:.2}%)",
        stats.accepted_count, stats.expected_count, stats.throughput_loss, stats.throughput_loss_percent
    );
    println!(
        "Sequence loss: {} | framing drops: {} | read errors: {}",
        stats.sequence_loss, stats.framing_drops, stats.read_errors
    );
    monitor.close().context("failed to close link")?;
    println!("Done.");
    Ok(())
}
