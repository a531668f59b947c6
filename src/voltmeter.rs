//! Per-frame signal statistics.
//!
//! RMS, mean and peak-to-peak come straight from the samples. Frequency and duty cycle need at
//! least two rising crossings of a [`CrossingDetector`]; with fewer they are `None`.

use crate::config::ChannelId;
use crate::frame::CapturedFrame;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltmeterReading {
    pub rms: f64,
    pub peak_to_peak: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Hz.
    pub frequency: Option<f64>,
    /// Fraction of a period spent above the crossing level, 0.0..=1.0.
    pub duty_cycle: Option<f64>,
}

pub type Readings = BTreeMap<ChannelId, VoltmeterReading>;

/// Rising crossings found in one trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Crossings {
    pub level: f64,
    /// Fractional sample positions, ascending.
    pub positions: Vec<f64>,
}

pub trait CrossingDetector: Debug + Send + Sync {
    /// `None` when the trace has no usable level, e.g. a flat line.
    fn rising_crossings(&self, voltages: &[f64]) -> Option<Crossings>;
}

/// Crossings of the midpoint between min and max, with a hysteresis band sized relative to the
/// peak-to-peak amplitude. Crossing positions are linearly interpolated between samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidLevelCrossings {
    pub hysteresis_fraction: f64,
}

impl Default for MidLevelCrossings {
    fn default() -> Self {
        Self {
            hysteresis_fraction: 0.1,
        }
    }
}

impl CrossingDetector for MidLevelCrossings {
    fn rising_crossings(&self, voltages: &[f64]) -> Option<Crossings> {
        let (min, max) = min_max(voltages)?;
        let peak_to_peak = max - min;
        if peak_to_peak <= f64::EPSILON {
            return None;
        }
        let level = (max + min) / 2.0;
        let rearm_below = level - peak_to_peak * self.hysteresis_fraction;

        let mut armed = false;
        let mut positions = Vec::new();
        for (i, pair) in voltages.windows(2).enumerate() {
            let (before, after) = (pair[0], pair[1]);
            if before < rearm_below {
                armed = true;
            }
            if armed && before < level && after >= level {
                positions.push(i as f64 + (level - before) / (after - before));
                armed = false;
            }
        }
        Some(Crossings { level, positions })
    }
}

fn min_max(voltages: &[f64]) -> Option<(f64, f64)> {
    let first = *voltages.first()?;
    Some(
        voltages
            .iter()
            .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v))),
    )
}

#[derive(Debug)]
pub struct Voltmeter {
    detector: Box<dyn CrossingDetector>,
}

impl Default for Voltmeter {
    fn default() -> Self {
        Self::new(Box::new(MidLevelCrossings::default()))
    }
}

impl Voltmeter {
    pub fn new(detector: Box<dyn CrossingDetector>) -> Self {
        Self { detector }
    }

    pub fn measure(&self, frame: &CapturedFrame) -> Readings {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("voltmeter");

        frame
            .channels
            .iter()
            .filter_map(|trace| {
                let voltages: Vec<f64> = trace.voltages().collect();
                self.measure_trace(&voltages, frame.sample_period)
                    .map(|reading| (trace.channel, reading))
            })
            .collect()
    }

    /// `None` for an empty trace.
    pub fn measure_trace(&self, voltages: &[f64], sample_period: f64) -> Option<VoltmeterReading> {
        let (min, max) = min_max(voltages)?;
        let n = voltages.len() as f64;
        let mean = voltages.iter().sum::<f64>() / n;
        let rms = (voltages.iter().map(|v| v * v).sum::<f64>() / n).sqrt();

        let mut frequency = None;
        let mut duty_cycle = None;
        if let Some(crossings) = self.detector.rising_crossings(voltages) {
            if let (Some(&first), Some(&last)) =
                (crossings.positions.first(), crossings.positions.last())
            {
                let span = last - first;
                if crossings.positions.len() >= 2 && span > 0.0 && sample_period > 0.0 {
                    let periods = (crossings.positions.len() - 1) as f64;
                    frequency = Some(periods / (span * sample_period));

                    let whole_periods = &voltages[first.ceil() as usize..last.ceil() as usize];
                    duty_cycle = (!whole_periods.is_empty()).then(|| {
                        let high = whole_periods
                            .iter()
                            .filter(|&&v| v >= crossings.level)
                            .count();
                        high as f64 / whole_periods.len() as f64
                    });
                }
            }
        }

        Some(VoltmeterReading {
            rms,
            peak_to_peak: max - min,
            mean,
            min,
            max,
            frequency,
            duty_cycle,
        })
    }
}

/// Averages readings over the last `depth` frames.
#[derive(Debug)]
pub struct RollingVoltmeter {
    depth: usize,
    history: VecDeque<Readings>,
}

impl RollingVoltmeter {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            history: VecDeque::with_capacity(depth.max(1)),
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn push(&mut self, readings: Readings) -> Readings {
        if self.history.len() == self.depth {
            self.history.pop_front();
        }
        self.history.push_back(readings);
        self.average()
    }

    pub fn average(&self) -> Readings {
        let mut channels: Vec<ChannelId> = self
            .history
            .iter()
            .flat_map(|readings| readings.keys().copied())
            .collect();
        channels.sort_unstable();
        channels.dedup();

        channels
            .into_iter()
            .filter_map(|channel| {
                let readings: Vec<&VoltmeterReading> = self
                    .history
                    .iter()
                    .filter_map(|r| r.get(&channel))
                    .collect();
                average_readings(&readings).map(|avg| (channel, avg))
            })
            .collect()
    }
}

fn average_readings(readings: &[&VoltmeterReading]) -> Option<VoltmeterReading> {
    if readings.is_empty() {
        return None;
    }
    let n = readings.len() as f64;
    let avg = |f: fn(&VoltmeterReading) -> f64| readings.iter().map(|r| f(r)).sum::<f64>() / n;
    let avg_some = |f: fn(&VoltmeterReading) -> Option<f64>| {
        let values: Vec<f64> = readings.iter().filter_map(|r| f(r)).collect();
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    };
    Some(VoltmeterReading {
        rms: avg(|r| r.rms),
        peak_to_peak: avg(|r| r.peak_to_peak),
        mean: avg(|r| r.mean),
        min: avg(|r| r.min),
        max: avg(|r| r.max),
        frequency: avg_some(|r| r.frequency),
        duty_cycle: avg_some(|r| r.duty_cycle),
    })
}
