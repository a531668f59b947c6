// Channel calibration example
//
// This example demonstrates the two-point calibration of one channel: a zero reading with
// the input grounded, then a reading with a known reference voltage applied. With --simulate
// the readings come from the software device instead of a real scope.

use clap::Parser;
use std::io::{self, Write};
use std::sync::mpsc;
use std::time::Duration;
use whoascope::config::ReconnectPolicy;
use whoascope::demux::Demultiplexer;
use whoascope::device_connector::SerialConnector;
use whoascope::simulator::{SignalSpec, SimulatedConnector, SimulatorConfig, Waveform};
use whoascope::{ChannelConfig, Connector, DeviceLink, DeviceSelector, LinearCalibration};

#[derive(Parser)]
#[command(name = "calibration")]
#[command(about = "Two-point calibration of a WhoaScope channel")]
struct Args {
    /// Channel to calibrate
    #[arg(short, long, default_value_t = 0)]
    channel: usize,

    /// Reference voltage applied during the second step
    #[arg(short, long, default_value_t = 3.3)]
    reference: f64,

    /// Volts/division the channel is calibrated at
    #[arg(long, default_value_t = 1.0)]
    vdiv: f64,

    /// Serial port of the scope
    #[arg(short, long)]
    port: Option<String>,

    /// Use the simulated device
    #[arg(long)]
    simulate: bool,

    /// Number of blocks averaged per step
    #[arg(short, long, default_value_t = 8)]
    blocks: usize,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn connector(args: &Args, volts: f64) -> Box<dyn Connector> {
    if !args.simulate {
        return Box::new(SerialConnector::default());
    }
    let dc = SignalSpec {
        offset: volts,
        ..SignalSpec::new(Waveform::Dc, 0.0, 0.0)
    };
    Box::new(SimulatedConnector::new(SimulatorConfig {
        signals: vec![dc; args.channel + 1],
        paced: false,
        ..SimulatorConfig::default()
    }))
}

/// Collect raw counts of the calibrated channel with `volts` at the input.
fn read_counts(args: &Args, volts: f64) -> Result<(Vec<i32>, u8), Box<dyn std::error::Error>> {
    let (events, _rx) = mpsc::channel();
    let mut link = DeviceLink::new(connector(args, volts), ReconnectPolicy::default(), events);
    let selector = match &args.port {
        Some(port) => DeviceSelector::by_port(port),
        None => DeviceSelector::any(),
    };
    let handle = link.connect(&selector)?;
    let channel_count = handle.info.channel_count();
    if args.channel >= channel_count {
        return Err(format!("Device has only {channel_count} channels").into());
    }

    let channels = vec![
        ChannelConfig {
            volts_per_division: args.vdiv,
            ..ChannelConfig::default()
        };
        channel_count
    ];
    let demux = Demultiplexer::new(handle.info.calibrations.clone());
    link.start_streaming(&channels)?;

    let mut counts = Vec::new();
    for _ in 0..args.blocks {
        let block = link.read_next_block(Duration::from_millis(500))?;
        let mut per_channel = demux.raw_counts(&block)?;
        counts.append(&mut per_channel[args.channel]);
    }
    link.stop_streaming()?;
    link.disconnect();
    Ok((counts, handle.info.capabilities.resolution_bits))
}

fn wait_for_user(args: &Args, message: &str) -> io::Result<()> {
    if args.simulate {
        println!("{message} (simulated)");
        return Ok(());
    }
    print!("{message} and press Enter...");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    println!("WhoaScope Channel Calibration");
    println!("=============================\n");

    println!("=== Zero Calibration ===");
    wait_for_user(&args, &format!("Ground the input of channel {}", args.channel))?;
    let (zero_counts, bits) = read_counts(&args, 0.0)?;
    let mut calibration = LinearCalibration::nominal(bits);
    println!("Nominal: {calibration:?}");
    let zero = calibration.calibrate_zero(&zero_counts)?;
    println!("✓ Zero at {zero:.2} counts ({} samples)\n", zero_counts.len());

    println!("=== Reference Calibration ===");
    wait_for_user(
        &args,
        &format!("Apply {} V to channel {}", args.reference, args.channel),
    )?;
    let (reference_counts, _) = read_counts(&args, args.reference)?;
    let span = calibration.calibrate_reference(&reference_counts, args.reference, args.vdiv)?;
    println!(
        "✓ {} V reads {span:.2} counts above zero at {} V/div\n",
        args.reference, args.vdiv
    );

    println!("=== Calibration Complete ===");
    println!("{}", serde_json::to_string_pretty(&calibration)?);
    Ok(())
}
