//! ADC count to voltage conversion.
//!
//! Calibration is device specific, so the demultiplexer only talks to the [`Calibration`]
//! trait. [`LinearCalibration`] is the two-point model the bundled device families use: one
//! reading taken with the input grounded (zero) and one with a known reference voltage applied.

use crate::config::{ChannelConfig, Coupling};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Largest spread in ADC counts accepted while calibrating from a supposedly constant input.
const MAX_STABLE_SPREAD: i32 = 14;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CalibrationError {
    #[error("No samples to calibrate from")]
    NoSamples,

    #[error("Signal too unstable for calibration (spread of {spread} counts)")]
    UnstableSignal { spread: i32 },

    #[error("Reference reading equals the zero reading, cannot derive a span")]
    DegenerateSpan,
}

pub trait Calibration: Debug + Send + Sync {
    /// Convert raw ADC counts into volts for a channel configured as `config`.
    fn counts_to_volts(&self, counts: i32, config: &ChannelConfig) -> f64;

    /// Inverse of [`Calibration::counts_to_volts`], before quantization.
    fn volts_to_counts(&self, volts: f64, config: &ChannelConfig) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearCalibration {
    /// Counts read with 0 V at the input.
    pub zero_counts: f64,
    /// Counts above `zero_counts` read with `reference_volts` at the input.
    pub reference_counts: f64,
    pub reference_volts: f64,
    /// Front-end volts/division setting the reference reading was taken at.
    pub calibrated_volts_per_division: f64,
}

impl LinearCalibration {
    pub fn new(
        zero_counts: f64,
        reference_counts: f64,
        reference_volts: f64,
        calibrated_volts_per_division: f64,
    ) -> Self {
        Self {
            zero_counts,
            reference_counts,
            reference_volts,
            calibrated_volts_per_division,
        }
    }

    /// Nominal calibration for a signed ADC of `bits` resolution whose full scale covers five
    /// divisions at 1 V/div.
    pub fn nominal(bits: u8) -> Self {
        let full_scale = f64::from(1u32 << (bits.clamp(2, 31) - 1));
        Self::new(0.0, full_scale, 5.0, 1.0)
    }

    fn volts_per_count(&self, config: &ChannelConfig) -> f64 {
        let gain = config.volts_per_division / self.calibrated_volts_per_division;
        self.reference_volts / self.reference_counts * gain
    }

    /// Mean of a constant reading, rejecting noisy input.
    pub fn stable_mean(counts: &[i32]) -> Result<f64, CalibrationError> {
        let (Some(min), Some(max)) = (counts.iter().min(), counts.iter().max()) else {
            return Err(CalibrationError::NoSamples);
        };
        let spread = max - min;
        if spread > MAX_STABLE_SPREAD {
            return Err(CalibrationError::UnstableSignal { spread });
        }
        let sum: f64 = counts.iter().map(|&c| f64::from(c)).sum();
        Ok(sum / counts.len() as f64)
    }

    /// Re-measure the zero point from counts read with the input grounded. The absolute
    /// position of the reference point is kept, so an existing reference calibration survives.
    pub fn calibrate_zero(&mut self, counts: &[i32]) -> Result<f64, CalibrationError> {
        let reference_absolute = self.zero_counts + self.reference_counts;
        let zero = Self::stable_mean(counts)?;
        if (reference_absolute - zero).abs() < f64::EPSILON {
            return Err(CalibrationError::DegenerateSpan);
        }
        self.zero_counts = zero;
        self.reference_counts = reference_absolute - zero;
        log::debug!(
            "Zero calibration: zero={:.2} reference={:.2}",
            self.zero_counts,
            self.reference_counts
        );
        Ok(zero)
    }

    /// Measure the span from counts read with `reference_volts` at the input, at the
    /// front-end setting `volts_per_division`.
    pub fn calibrate_reference(
        &mut self,
        counts: &[i32],
        reference_volts: f64,
        volts_per_division: f64,
    ) -> Result<f64, CalibrationError> {
        let span = Self::stable_mean(counts)? - self.zero_counts;
        if span.abs() < f64::EPSILON {
            return Err(CalibrationError::DegenerateSpan);
        }
        self.reference_counts = span;
        self.reference_volts = reference_volts;
        self.calibrated_volts_per_division = volts_per_division;
        log::debug!(
            "Reference calibration: {:.2} counts for {} V at {} V/div",
            span,
            reference_volts,
            volts_per_division
        );
        Ok(span)
    }
}

impl Calibration for LinearCalibration {
    fn counts_to_volts(&self, counts: i32, config: &ChannelConfig) -> f64 {
        if config.coupling == Coupling::Ground {
            return config.offset;
        }
        (f64::from(counts) - self.zero_counts) * self.volts_per_count(config) + config.offset
    }

    fn volts_to_counts(&self, volts: f64, config: &ChannelConfig) -> f64 {
        (volts - config.offset) / self.volts_per_count(config) + self.zero_counts
    }
}
