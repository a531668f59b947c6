//! Acquisition engine against the simulated device, from raw blocks to voltmeter readings.

use std::thread;
use std::time::{Duration, Instant};
use whoascope::config::AcquisitionConfig;
use whoascope::handoff::QueueReceiver;
use whoascope::settings::Settings;
use whoascope::simulator::{SignalSpec, SimulatedConnector, SimulatorConfig, Waveform};
use whoascope::{ChannelConfig, ConnectionEvent, DeviceSelector, FrameOutput, TriggerConfig};

const RATE: f64 = 1_000_000.0;

fn square_scope(paced: bool) -> SimulatedConnector {
    SimulatedConnector::new(SimulatorConfig {
        sample_rate: RATE,
        block_frames: 1000,
        signals: vec![
            SignalSpec::new(Waveform::Square, 1000.0, 1.0),
            SignalSpec::new(Waveform::Sine, 500.0, 0.5),
        ],
        paced,
    })
}

fn settings(frame_length: usize, queue_capacity: usize) -> Settings {
    Settings {
        acquisition: AcquisitionConfig {
            frame_length,
            ring_capacity: 1 << 16,
            queue_capacity,
            ..AcquisitionConfig::default()
        },
        trigger: TriggerConfig::start_capturing_when(0)
            .with_hysteresis(0.1)
            .pre_trigger(0.5)
            .normal()
            .rising_edge(0.0),
        ..Settings::default()
    }
}

fn collect(frames: &QueueReceiver<FrameOutput>, count: usize) -> Vec<FrameOutput> {
    let mut collected = Vec::with_capacity(count);
    while collected.len() < count {
        collected.push(frames.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    collected
}

fn assert_contiguous(output: &FrameOutput) {
    for trace in &output.frame.channels {
        for pair in trace.samples.windows(2) {
            let step = pair[1].0 - pair[0].0;
            assert!((step - 1.0 / RATE).abs() < 1e-9, "step {step}");
        }
    }
}

#[test]
fn test_square_wave_frames_align_on_edges() {
    let mut engine = whoascope::spawn(
        Box::new(square_scope(true)),
        DeviceSelector::any(),
        settings(500, 64),
    )
    .unwrap();

    let outputs = collect(engine.frames(), 20);
    for output in &outputs {
        let frame = &output.frame;
        assert!(!frame.free_run);
        assert_eq!(frame.len(), 500);
        assert_eq!(frame.trigger_index, 250);

        let periods = frame.trigger_time * 1000.0;
        assert!((periods - periods.round()).abs() < 1e-6, "{}", frame.trigger_time);

        let square: Vec<f64> = frame.channel(0).unwrap().voltages().collect();
        assert!(square[249] < -0.9);
        assert!(square[250] > 0.9);
        assert_contiguous(output);
    }
    for pair in outputs.windows(2) {
        assert_eq!(pair[1].frame.sequence, pair[0].frame.sequence + 1);
        let spacing = pair[1].frame.trigger_time - pair[0].frame.trigger_time;
        assert!((spacing - 1e-3).abs() < 1e-9, "spacing {spacing}");
    }

    engine.stop();
    engine.join().unwrap();
}

#[test]
fn test_voltmeter_reports_signal_parameters() {
    let engine = whoascope::spawn(
        Box::new(square_scope(true)),
        DeviceSelector::any(),
        settings(8000, 4),
    )
    .unwrap();

    let output = engine.frames().recv_timeout(Duration::from_secs(5)).unwrap();
    let square = &output.readings[&0];
    assert!((square.peak_to_peak - 2.0).abs() < 0.01);
    assert!((square.rms - 1.0).abs() < 0.01);
    assert!((square.frequency.unwrap() - 1000.0).abs() < 1.0);
    assert!((square.duty_cycle.unwrap() - 0.5).abs() < 0.01);

    let sine = &output.readings[&1];
    assert!((sine.peak_to_peak - 1.0).abs() < 0.01);
    assert!((sine.frequency.unwrap() - 500.0).abs() < 1.0);
}

#[test]
fn test_disabled_channel_is_not_captured() {
    let mut single_channel = settings(500, 4);
    single_channel.channels = vec![ChannelConfig::default(), ChannelConfig::disabled()];
    let engine = whoascope::spawn(
        Box::new(square_scope(true)),
        DeviceSelector::any(),
        single_channel,
    )
    .unwrap();

    let output = engine.frames().recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(output.frame.channels.len(), 1);
    assert!(output.frame.channel(1).is_none());
    assert!(!output.readings.contains_key(&1));
}

#[test]
fn test_unplug_flushes_and_resumes() {
    let connector = square_scope(true);
    let control = connector.control();
    let mut engine = whoascope::spawn(
        Box::new(connector),
        DeviceSelector::any(),
        settings(500, 4096),
    )
    .unwrap();

    let first = engine.frames().recv_timeout(Duration::from_secs(5)).unwrap();
    thread::sleep(Duration::from_millis(100));
    control.unplug_for(Duration::from_millis(300));

    // Wait for frames from the second session.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut outputs = vec![first];
    loop {
        let output = engine.frames().recv_timeout(Duration::from_secs(5)).unwrap();
        let resumed = output.session > outputs[0].session;
        outputs.push(output);
        if resumed {
            break;
        }
        assert!(Instant::now() < deadline);
    }
    outputs.extend(collect(engine.frames(), 5));

    for output in &outputs {
        assert_contiguous(output);
    }
    let gap = outputs
        .windows(2)
        .find(|pair| pair[1].session != pair[0].session)
        .unwrap();
    assert!(gap[1].frame.trigger_time - gap[0].frame.trigger_time >= 0.3);
    for pair in outputs.windows(2) {
        assert!(pair[1].frame.trigger_time > pair[0].frame.trigger_time);
    }

    let events: Vec<ConnectionEvent> = engine.events().try_iter().collect();
    let faulted = events
        .iter()
        .position(|e| matches!(e, ConnectionEvent::Faulted(_)))
        .unwrap();
    assert!(events[faulted..]
        .iter()
        .any(|e| matches!(e, ConnectionEvent::Streaming)));

    engine.stop();
    engine.join().unwrap();
    assert!(engine.diagnostics().reconnects >= 1);
    assert!(control.connects() >= 2);
}

#[test]
fn test_stalled_consumer_keeps_newest_frames() {
    let capacity = 4;
    let mut engine = whoascope::spawn(
        Box::new(square_scope(false)),
        DeviceSelector::any(),
        settings(500, capacity),
    )
    .unwrap();

    thread::sleep(Duration::from_millis(300));
    engine.stop();
    engine.join().unwrap();

    let diagnostics = engine.diagnostics();
    assert!(diagnostics.frames_emitted > capacity as u64);
    assert_eq!(
        diagnostics.dropped_frames,
        diagnostics.frames_emitted - capacity as u64
    );

    let kept = engine.frames().drain();
    assert_eq!(kept.len(), capacity);
    assert_eq!(
        kept[capacity - 1].frame.sequence,
        diagnostics.frames_emitted - 1
    );
    for pair in kept.windows(2) {
        assert_eq!(pair[1].frame.sequence, pair[0].frame.sequence + 1);
    }
}
