// Simulated scope example
//
// Runs the full acquisition engine against the software device: triggers on channel 0,
// prints voltmeter readings per frame and optionally pulls the plug mid-stream to show the
// reconnect behavior.

use clap::Parser;
use std::thread;
use std::time::{Duration, Instant};
use whoascope::settings::Settings;
use whoascope::simulator::{SignalSpec, SimulatedConnector, SimulatorConfig, Waveform};
use whoascope::{DeviceSelector, TriggerConfig};

#[derive(Parser)]
#[command(name = "simulated_scope")]
#[command(about = "Stream triggered frames from a simulated WhoaScope")]
struct Args {
    /// Waveform on channel 0
    #[arg(short, long, default_value = "square", value_parser = ["sine", "square", "triangle"])]
    waveform: String,

    /// Signal frequency in Hz
    #[arg(short, long, default_value_t = 1000.0)]
    frequency: f64,

    /// Trigger level in volts
    #[arg(short, long, default_value_t = 0.0)]
    level: f64,

    /// Number of frames to print
    #[arg(short = 'n', long, default_value_t = 10)]
    frames: usize,

    /// Unplug the simulated device for 300 ms after this many milliseconds
    #[arg(long)]
    unplug_after: Option<u64>,

    /// Print the first frame as a table
    #[arg(long)]
    table: bool,

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

    let waveform = match args.waveform.as_str() {
        "sine" => Waveform::Sine,
        "triangle" => Waveform::Triangle,
        _ => Waveform::Square,
    };

    println!("WhoaScope Simulator");
    println!("===================");
    println!("Signal: {} Hz {}", args.frequency, waveform.as_str());

    let connector = SimulatedConnector::new(SimulatorConfig {
        signals: vec![
            SignalSpec::new(waveform, args.frequency, 1.0),
            SignalSpec::new(Waveform::Sine, args.frequency / 4.0, 0.5),
        ],
        ..SimulatorConfig::default()
    });
    let control = connector.control();

    let settings = Settings {
        trigger: TriggerConfig::start_capturing_when(0)
            .with_hysteresis(0.1)
            .auto(Duration::from_millis(50))
            .rising_edge(args.level),
        ..Settings::default()
    };
    let mut engine = whoascope::spawn(Box::new(connector), DeviceSelector::any(), settings)?;

    if let Some(after) = args.unplug_after {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(after));
            println!(">>> Unplugging for 300 ms");
            control.unplug_for(Duration::from_millis(300));
        });
    }

    let start = Instant::now();
    let mut printed = 0;
    while printed < args.frames && engine.is_running() {
        while let Ok(event) = engine.events().try_recv() {
            println!("Connection: {event:?}");
        }
        let Ok(output) = engine.frames().recv_timeout(Duration::from_secs(2)) else {
            println!("No frame within 2 s, state {:?}", engine.state());
            continue;
        };
        let frame = &output.frame;
        print!(
            "#{:<4} t={:>9.6}s {}",
            frame.sequence,
            frame.trigger_time,
            if frame.free_run { "free-run " } else { "triggered" }
        );
        for (channel, reading) in &output.readings {
            print!(
                " | ch{}: {:.3} Vrms {:.3} Vpp",
                channel, reading.rms, reading.peak_to_peak
            );
            if let Some(frequency) = reading.frequency {
                print!(" {frequency:.1} Hz");
            }
        }
        println!();

        if args.table && printed == 0 {
            println!("{}", frame.to_dataframe()?.head(Some(10)));
        }
        printed += 1;
    }

    engine.stop();
    engine.join()?;

    let diagnostics = engine.diagnostics();
    println!("\nRan for {:.2} s", start.elapsed().as_secs_f64());
    println!("Frames emitted:  {}", diagnostics.frames_emitted);
    println!("Frames dropped:  {}", diagnostics.dropped_frames);
    println!("Stale frames:    {}", diagnostics.stale_frames);
    println!("Reconnects:      {}", diagnostics.reconnects);
    println!("Discontinuities: {}", diagnostics.discontinuities);
    Ok(())
}
