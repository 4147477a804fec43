//! AES67 bridge command-line front end.
//!
//! Wires the bridge to the cpal audio engine, installs the signal handlers
//! and prints a status line once per second while networking runs.

use std::net::Ipv4Addr;
use std::process::exit;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aes67_bridge::audio::{AudioEngine, CpalEngine};
use aes67_bridge::bridge::{Aes67Bridge, BridgeMode};
use aes67_bridge::config::{BitDepth, StreamConfig};
use aes67_bridge::error::BridgeError;

/// Signal number received; 0 while running. The handler only stores it, the
/// main loop does the actual shutdown.
static SHUTDOWN_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_signal(signum: libc::c_int) {
    SHUTDOWN_SIGNAL.store(signum, Ordering::SeqCst);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ModeArg {
    Transmit,
    Receive,
}

/// Bridge AES67 multicast audio to and from the local audio engine.
#[derive(Debug, Parser)]
#[command(name = "aes67-bridge", version)]
struct Args {
    /// Direction of the bridge
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// Multicast group address
    #[arg(short, long, default_value = "239.69.83.133")]
    address: Ipv4Addr,

    /// UDP port
    #[arg(short, long, default_value_t = 5004)]
    port: u16,

    /// IPv4 address of the local network interface
    #[arg(short, long)]
    interface: Option<Ipv4Addr>,

    /// Wire sample depth in bits (16, 24 or 32)
    #[arg(short, long, default_value_t = 24)]
    bit_depth: u16,

    /// Packet duration in microseconds (125, 250, 333, 1000 or 4000)
    #[arg(short = 't', long, default_value_t = 1000)]
    packet_time: u32,

    /// Begin networking immediately
    #[arg(short, long)]
    start: bool,
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if let Err(code) = run(args) {
        exit(code);
    }
}

fn fail(error: BridgeError) -> i32 {
    error!("{error}");
    1
}

fn run(args: Args) -> Result<(), i32> {
    let bit_depth = BitDepth::from_bits(args.bit_depth).map_err(fail)?;
    let config = StreamConfig {
        bit_depth,
        packet_time_us: args.packet_time,
        group: args.address,
        port: args.port,
        interface: args.interface,
        ..StreamConfig::default()
    };
    config.validate().map_err(fail)?;

    let mut bridge = Aes67Bridge::new(config.clone()).map_err(fail)?;
    match args.mode {
        Some(ModeArg::Transmit) => bridge.set_mode(BridgeMode::Transmit).map_err(fail)?,
        Some(ModeArg::Receive) => bridge.set_mode(BridgeMode::Receive).map_err(fail)?,
        None => {}
    }

    let mut engine = CpalEngine::new(config.channels, config.sample_rate);
    engine.register_callback(bridge.process_fn());
    engine.set_sample_rate_listener(bridge.sample_rate_listener());
    engine.connect_inputs().map_err(fail)?;
    engine.connect_outputs().map_err(fail)?;
    engine.activate().map_err(fail)?;

    if args.start {
        if args.mode.is_none() {
            error!("--start requires --mode");
            return Err(1);
        }
        bridge.start_networking().map_err(fail)?;
    } else {
        info!("networking idle; pass --start to begin immediately");
    }

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    info!("bridge running, press Ctrl+C to exit");
    let mut last_status = Instant::now();
    loop {
        std::thread::sleep(Duration::from_millis(200));

        let signal = SHUTDOWN_SIGNAL.load(Ordering::SeqCst);
        if signal != 0 {
            info!(signal, "shutting down");
            bridge.stop_networking();
            let _ = engine.deactivate();
            engine.teardown();
            return Err(signal);
        }

        if bridge.is_network_active() && last_status.elapsed() >= Duration::from_secs(1) {
            last_status = Instant::now();
            let stats = bridge.rtp_stats();
            let synchronized = bridge
                .ptp_status()
                .map(|status| status.synchronized)
                .unwrap_or(false);
            info!(
                buffer_pct = (bridge.buffer_level() * 100.0) as u32,
                sent = stats.packets_sent,
                received = stats.packets_received,
                dropped = stats.packets_dropped,
                out_of_order = stats.out_of_order,
                ptp = synchronized,
                "status"
            );
        }
    }
}
