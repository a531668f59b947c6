//! Software acquisition device.
//!
//! Generates periodic test signals with the same block layout a real device streams, so the
//! whole engine can run without hardware. A [`SimulatorControl`] handle injects faults: while
//! the device is "unplugged", reads fail with [`LinkError::Unplugged`] and connection attempts
//! fail with [`ConnectError::DeviceNotFound`]. The simulated sample clock keeps running while
//! unplugged, so the stream resumes with a sequence gap like real hardware would.

use crate::calibration::{Calibration, LinearCalibration};
use crate::config::ChannelConfig;
use crate::device::{
    Capabilities, ConnectionState, DeviceFamily, DeviceInfo, DeviceSelector, RawSampleBlock,
};
use crate::device_link::{ConnectError, Connector, LinkError, Transport};
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

pub const SIMULATOR_NAME: &str = "WhoaScope Simulator";
pub const SIMULATOR_PORT: &str = "sim://0";

#[derive(Debug, Clone, PartialEq, Copy)]
pub enum Waveform {
    Sine,
    Square,
    Triangle,
    Dc,
}

impl Waveform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Waveform::Sine => "sine",
            Waveform::Square => "square",
            Waveform::Triangle => "triangle",
            Waveform::Dc => "dc",
        }
    }

    /// Unit-amplitude value at `cycles` periods since the signal origin.
    fn value(self, cycles: f64) -> f64 {
        let phase = cycles - cycles.floor();
        match self {
            Waveform::Sine => (TAU * phase).sin(),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Triangle => 4.0 * (phase - 0.5).abs() - 1.0,
            Waveform::Dc => 0.0,
        }
    }
}

/// Signal fed into one simulated channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSpec {
    pub waveform: Waveform,
    pub frequency: f64,
    pub amplitude: f64,
    pub offset: f64,
    /// Phase in cycles, `0.0..1.0`.
    pub phase: f64,
}

impl Default for SignalSpec {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            frequency: 1000.0,
            amplitude: 1.0,
            offset: 0.0,
            phase: 0.0,
        }
    }
}

impl SignalSpec {
    pub fn new(waveform: Waveform, frequency: f64, amplitude: f64) -> Self {
        Self {
            waveform,
            frequency,
            amplitude,
            ..Self::default()
        }
    }

    /// Voltage at device sample `sequence`. Computed from the integer sample counter so edges
    /// land on exact sample boundaries.
    pub fn voltage_at(&self, sequence: u64, sample_rate: f64) -> f64 {
        let cycles = (sequence as f64 * self.frequency) / sample_rate + self.phase;
        self.offset + self.amplitude * self.waveform.value(cycles)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub sample_rate: f64,
    /// Sample-frames per block.
    pub block_frames: usize,
    /// One signal per channel.
    pub signals: Vec<SignalSpec>,
    /// Deliver blocks in real time instead of as fast as they are read.
    pub paced: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1_000_000.0,
            block_frames: 1000,
            signals: vec![SignalSpec::default(), SignalSpec::new(Waveform::Square, 500.0, 0.5)],
            paced: true,
        }
    }
}

#[derive(Debug)]
struct ControlState {
    sample_rate: f64,
    unplugged_until: Mutex<Option<Instant>>,
    sequence: AtomicU64,
    connects: AtomicU64,
}

/// Fault injection and introspection for a simulated device.
#[derive(Debug, Clone)]
pub struct SimulatorControl(Arc<ControlState>);

impl SimulatorControl {
    fn new(sample_rate: f64) -> Self {
        Self(Arc::new(ControlState {
            sample_rate,
            unplugged_until: Mutex::new(None),
            sequence: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }))
    }

    /// Pull the plug for `duration`. The sample counter advances by the samples the device
    /// would have taken meanwhile.
    pub fn unplug_for(&self, duration: Duration) {
        log::debug!("Simulator unplugged for {:?}", duration);
        *self
            .0
            .unplugged_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + duration);
        let gap = (duration.as_secs_f64() * self.0.sample_rate) as u64;
        self.0.sequence.fetch_add(gap, Ordering::SeqCst);
    }

    pub fn is_plugged(&self) -> bool {
        self.0
            .unplugged_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none_or(|until| Instant::now() >= until)
    }

    /// Number of successful opens so far.
    pub fn connects(&self) -> u64 {
        self.0.connects.load(Ordering::SeqCst)
    }

    /// Next sample counter value the device will emit.
    pub fn sequence(&self) -> u64 {
        self.0.sequence.load(Ordering::SeqCst)
    }

    fn take_frames(&self, frames: u64) -> u64 {
        self.0.sequence.fetch_add(frames, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    config: SimulatorConfig,
    control: SimulatorControl,
}

impl SimulatedConnector {
    pub fn new(config: SimulatorConfig) -> Self {
        let control = SimulatorControl::new(config.sample_rate);
        Self { config, control }
    }

    pub fn control(&self) -> SimulatorControl {
        self.control.clone()
    }

    fn matches(selector: &DeviceSelector) -> bool {
        selector.port.as_deref().is_none_or(|p| p == SIMULATOR_PORT)
            && selector.name.as_deref().is_none_or(|n| n == SIMULATOR_NAME)
    }
}

impl Connector for SimulatedConnector {
    fn open(&mut self, selector: &DeviceSelector) -> Result<Box<dyn Transport>, ConnectError> {
        if !self.control.is_plugged() || !Self::matches(selector) {
            return Err(ConnectError::DeviceNotFound {
                selector: selector.to_string(),
            });
        }
        self.control.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedTransport::new(
            self.config.clone(),
            self.control.clone(),
        )))
    }
}

pub struct SimulatedTransport {
    config: SimulatorConfig,
    control: SimulatorControl,
    calibration: LinearCalibration,
    channels: Vec<ChannelConfig>,
    streaming: bool,
    stream_start: Instant,
    frames_streamed: u64,
}

impl SimulatedTransport {
    fn new(config: SimulatorConfig, control: SimulatorControl) -> Self {
        Self {
            config,
            control,
            calibration: DeviceFamily::Simulated.nominal_calibration(),
            channels: Vec::new(),
            streaming: false,
            stream_start: Instant::now(),
            frames_streamed: 0,
        }
    }

    fn channel_count(&self) -> usize {
        self.config.signals.len()
    }

    fn encode(&self, sequence: u64, frames: usize) -> RawSampleBlock {
        // The front end applies gain only; the vertical offset is added after scaling.
        let front_end: Vec<ChannelConfig> = (0..self.channel_count())
            .map(|channel| ChannelConfig {
                offset: 0.0,
                ..self.channels.get(channel).cloned().unwrap_or_default()
            })
            .collect();
        let front_end = &front_end;
        let counts = (0..frames as u64).flat_map(|frame| {
            self.config
                .signals
                .iter()
                .zip(front_end)
                .map(move |(signal, config)| {
                    let volts = signal.voltage_at(sequence + frame, self.config.sample_rate);
                    let counts = self.calibration.volts_to_counts(volts, config).round();
                    counts.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
                })
        });
        RawSampleBlock::from_counts(
            sequence,
            self.config.sample_rate,
            self.channel_count(),
            counts,
        )
    }
}

impl Transport for SimulatedTransport {
    fn handshake(&mut self) -> Result<DeviceInfo, LinkError> {
        if !self.control.is_plugged() {
            return Err(LinkError::Unplugged);
        }
        let family = DeviceFamily::Simulated;
        let capabilities = Capabilities {
            channel_count: self.channel_count(),
            ..family.capabilities()
        };
        Ok(DeviceInfo {
            family,
            name: SIMULATOR_NAME.to_string(),
            port: SIMULATOR_PORT.to_string(),
            firmware: "sim-1".to_string(),
            capabilities,
            sample_rate: self.config.sample_rate,
            calibrations: (0..self.channel_count())
                .map(|_| Arc::new(self.calibration) as Arc<dyn Calibration>)
                .collect(),
        })
    }

    fn start_streaming(&mut self, channels: &[ChannelConfig]) -> Result<(), LinkError> {
        self.channels = channels.to_vec();
        self.streaming = true;
        self.stream_start = Instant::now();
        self.frames_streamed = 0;
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), LinkError> {
        self.streaming = false;
        Ok(())
    }

    fn read_block(&mut self, timeout: Duration) -> Result<RawSampleBlock, LinkError> {
        if !self.control.is_plugged() {
            return Err(LinkError::Unplugged);
        }
        if !self.streaming {
            return Err(LinkError::NotStreaming(ConnectionState::Connected));
        }

        let frames = self.config.block_frames;
        if self.config.paced {
            let due = self.stream_start
                + Duration::from_secs_f64(
                    (self.frames_streamed + frames as u64) as f64 / self.config.sample_rate,
                );
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Err(LinkError::Timeout(timeout));
                }
                thread::sleep(wait);
            }
            if !self.control.is_plugged() {
                return Err(LinkError::Unplugged);
            }
        }

        let sequence = self.control.take_frames(frames as u64);
        self.frames_streamed += frames as u64;
        Ok(self.encode(sequence, frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waveform_as_str() {
        assert_eq!(Waveform::Sine.as_str(), "sine");
        assert_eq!(Waveform::Square.as_str(), "square");
        assert_eq!(Waveform::Triangle.as_str(), "triangle");
        assert_eq!(Waveform::Dc.as_str(), "dc");
    }

    #[test]
    fn test_square_edges_on_sample_boundaries() {
        let square = SignalSpec::new(Waveform::Square, 1000.0, 1.0);
        assert_eq!(square.voltage_at(999, 1_000_000.0), -1.0);
        assert_eq!(square.voltage_at(1000, 1_000_000.0), 1.0);
        assert_eq!(square.voltage_at(1499, 1_000_000.0), 1.0);
        assert_eq!(square.voltage_at(1500, 1_000_000.0), -1.0);
    }

    #[test]
    fn test_blocks_are_contiguous() {
        let mut connector = SimulatedConnector::new(SimulatorConfig {
            block_frames: 64,
            paced: false,
            ..SimulatorConfig::default()
        });
        let mut transport = connector.open(&DeviceSelector::any()).unwrap();
        let info = transport.handshake().unwrap();
        assert_eq!(info.channel_count(), 2);
        transport.start_streaming(&[]).unwrap();
        let first = transport.read_block(Duration::from_millis(10)).unwrap();
        let second = transport.read_block(Duration::from_millis(10)).unwrap();
        assert_eq!(first.payload.len(), 64 * 2 * 2);
        assert_eq!(second.sequence, first.sequence + 64);
    }

    #[test]
    fn test_unplug_fails_reads_and_skips_samples() {
        let mut connector = SimulatedConnector::new(SimulatorConfig {
            paced: false,
            ..SimulatorConfig::default()
        });
        let control = connector.control();
        let mut transport = connector.open(&DeviceSelector::any()).unwrap();
        transport.start_streaming(&[]).unwrap();
        transport.read_block(Duration::from_millis(10)).unwrap();

        control.unplug_for(Duration::from_millis(20));
        assert!(matches!(
            transport.read_block(Duration::from_millis(10)),
            Err(LinkError::Unplugged)
        ));
        assert!(connector.open(&DeviceSelector::any()).is_err());
        assert_eq!(control.sequence(), 1000 + 20_000);

        thread::sleep(Duration::from_millis(30));
        assert!(control.is_plugged());
        assert!(connector.open(&DeviceSelector::any()).is_ok());
        assert_eq!(control.connects(), 2);
    }
}
