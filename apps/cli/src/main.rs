use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use hidbridge_core::events::compose;
use hidbridge_core::{
    Bridge, BridgeConfig, ConfigOverrides, NusbBackend, PermissionOutcome, ReaderMode, UsbBackend,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB HID bulk bridge", long_about = None)]
struct Args {
    /// Vendor ID, hex (0x0483) or decimal
    #[arg(long, value_parser = parse_id)]
    vid: Option<u16>,

    /// Product ID, hex (0x5740) or decimal
    #[arg(long, value_parser = parse_id)]
    pid: Option<u16>,

    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interface whose bulk endpoints are bridged
    #[arg(long)]
    interface: Option<u8>,

    /// Poll every bulk-in endpoint from a single reader
    #[arg(long)]
    sweep: bool,

    /// Payload to write once reading has started; `hex:01ff..` for raw bytes
    #[arg(long = "write", value_parser = parse_payload)]
    writes: Vec<Payload>,

    /// Seconds to keep reading before closing
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// List attached devices and exit
    #[arg(long)]
    list: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_id(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid USB id '{}': {}", s, e))
}

/// Bytes given with `--write`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Payload(Vec<u8>);

fn parse_payload(s: &str) -> Result<Payload, String> {
    let Some(hex) = s.strip_prefix("hex:") else {
        return Ok(Payload(s.as_bytes().to_vec()));
    };
    let digits: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        return Err(format!("non-hex characters in '{}'", hex));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{}'", hex));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("invalid hex byte '{}': {}", &digits[i..i + 2], e))
        })
        .collect::<Result<Vec<u8>, String>>()
        .map(Payload)
}

fn list_devices() -> Result<()> {
    let devices = NusbBackend::new().enumerate()?;
    if devices.is_empty() {
        println!("No USB devices found");
    }
    for device in devices {
        println!("{}", device);
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    if args.list {
        return list_devices();
    }

    let base = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)?,
        None => BridgeConfig::default(),
    };
    let config = base.merge(&ConfigOverrides {
        vendor_id: args.vid,
        product_id: args.pid,
        interface_number: args.interface,
        reader_mode: args.sweep.then_some(ReaderMode::Sweep),
        poll_interval_ms: None,
    });
    let (vid, pid) = (config.vendor_id, config.product_id);

    let bridge = Bridge::new(NusbBackend::new(), config);
    if !bridge.open() {
        bail!("Device {:04X}:{:04X} not found", vid, pid);
    }

    match bridge.wait_for_permission(Duration::from_secs(10)) {
        Some(PermissionOutcome::Granted) => {}
        Some(PermissionOutcome::Denied) => bail!("Access to {:04X}:{:04X} was denied", vid, pid),
        None => warn!("Permission still pending, readers will wait for it"),
    }

    let readers = bridge.start_reading();
    info!(readers, "Reading");

    for Payload(payload) in &args.writes {
        let report = bridge
            .write_report(payload)
            .with_context(|| format!("writing {} bytes", payload.len()))?;
        for failure in report.failures() {
            warn!(endpoint = %format!("0x{:02X}", failure.endpoint), "Write incomplete");
        }
    }

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        if let Some(frame) = bridge.wait_for_data(remaining.min(Duration::from_millis(100))) {
            println!(
                "EP:0x{:02X} #{} [{}] {}",
                frame.endpoint(),
                frame.sequence(),
                frame.len(),
                compose(frame.data())
            );
        }
    }

    bridge.close();
    let dropped = bridge.queue().dropped();
    if dropped > 0 {
        warn!(dropped, "Frames dropped on a full queue");
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Cannot install log subscriber: {}", e);
    }

    info!("Starting hidbridge (nusb backend)...");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
