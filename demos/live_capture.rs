// Live capture example
//
// This example demonstrates triggered acquisition from a real scope: the saved settings are
// loaded, command line overrides applied, and every frame is summarized with its voltmeter
// readings until the requested number of frames has arrived.

use clap::Parser;
use std::time::Duration;
use whoascope::device_connector::SerialConnector;
use whoascope::settings::SettingsStore;
use whoascope::{DeviceSelector, TriggerConfig, TriggerMode};

#[derive(Parser)]
#[command(name = "live_capture")]
#[command(about = "Capture triggered frames from a WhoaScope")]
struct Args {
    /// Name of the scope to connect to
    device: Option<String>,

    /// Serial port of the scope
    #[arg(short, long)]
    port: Option<String>,

    /// Number of frames to capture
    #[arg(short = 'n', long, default_value_t = 20)]
    frames: usize,

    /// Trigger source channel
    #[arg(short, long, default_value_t = 0)]
    source: usize,

    /// Trigger level in volts
    #[arg(short, long)]
    level: Option<f64>,

    /// Trigger on the falling edge
    #[arg(long)]
    falling: bool,

    /// Trigger mode
    #[arg(short, long, value_parser = ["normal", "auto", "single"])]
    mode: Option<String>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_settings: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
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

    println!("WhoaScope Live Capture");
    println!("======================\n");

    for device in SerialConnector::available_devices()? {
        println!("Found {} '{}' at {}", device.family, device.name, device.port);
    }

    let store = SettingsStore::default_location()?;
    let mut settings = store.load();
    println!("Settings from {}", store.path().display());

    if args.level.is_some() || args.mode.is_some() || args.falling || args.source != 0 {
        let builder = TriggerConfig::start_capturing_when(args.source)
            .with_hysteresis(settings.trigger.hysteresis)
            .pre_trigger(settings.trigger.pre_trigger_fraction);
        let builder = match args.mode.as_deref() {
            Some("normal") => builder.normal(),
            Some("single") => builder.single(),
            _ => builder.auto(settings.trigger.auto_timeout),
        };
        let level = args.level.unwrap_or(settings.trigger.level);
        settings.trigger = if args.falling {
            builder.falling_edge(level)
        } else {
            builder.rising_edge(level)
        };
    }

    let port = args.port.clone().or(settings.last_port.clone());
    let selector = DeviceSelector {
        name: args.device.clone(),
        port: port.clone(),
    };
    println!("Connecting to {selector}");
    println!(
        "Trigger: ch{} {} {:.3} V ({})\n",
        settings.trigger.source,
        settings.trigger.edge.as_str(),
        settings.trigger.level,
        settings.trigger.mode.as_str()
    );

    if args.save_settings {
        settings.last_port = port;
        store.save(&settings)?;
        println!("Saved settings to {}", store.path().display());
    }

    let mut engine = whoascope::spawn(
        Box::new(SerialConnector::default()),
        selector,
        settings.clone(),
    )?;

    let mut captured = 0;
    while captured < args.frames && engine.is_running() {
        while let Ok(event) = engine.events().try_recv() {
            println!("Connection: {event:?}");
        }
        let output = match engine.frames().recv_timeout(Duration::from_secs(1)) {
            Ok(output) => output,
            Err(e) => {
                println!("Waiting for trigger ({e})");
                continue;
            }
        };
        captured += 1;
        println!(
            "Frame {} (session {}) at {:.6}s, {} samples/channel",
            output.frame.sequence,
            output.session,
            output.frame.trigger_time,
            output.frame.len()
        );
        for (channel, reading) in &output.rolling {
            println!(
                "  ch{}: mean {:+.3} V, rms {:.3} V, p-p {:.3} V, f {}, duty {}",
                channel,
                reading.mean,
                reading.rms,
                reading.peak_to_peak,
                reading
                    .frequency
                    .map_or_else(|| "-".to_string(), |f| format!("{f:.1} Hz")),
                reading
                    .duty_cycle
                    .map_or_else(|| "-".to_string(), |d| format!("{:.1}%", d * 100.0))
            );
        }
        if settings.trigger.mode == TriggerMode::Single {
            engine.rearm();
        }
    }

    engine.stop();
    engine.join()?;
    println!("\n{:#?}", engine.diagnostics());
    Ok(())
}
