//! Raw block decoding.
//!
//! The [`Demultiplexer`] turns interleaved ADC counts into [`ScaledSample`]s, applying each
//! channel's calibration and vertical settings. It also tracks the device sample counter across
//! blocks: a jump in the counter is reported as a discontinuity so the caller can drop
//! everything derived from samples before the gap. Timestamps never go backwards, even if the
//! device restarts its counter.

use crate::calibration::Calibration;
use crate::config::{ChannelConfig, ChannelId};
use crate::device::RawSampleBlock;
use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("Empty sample block")]
    EmptyBlock,

    #[error("Payload of {len} bytes is not a whole number of {frame_bytes}-byte sample frames")]
    MisalignedPayload { len: usize, frame_bytes: usize },

    #[error("Block carries {block} channels, device has {expected}")]
    ChannelCountMismatch { block: usize, expected: usize },

    #[error("Invalid sample rate {0}")]
    InvalidSampleRate(f64),

    #[error("Block at sequence {0} runs past the end of the sample counter")]
    SequenceOverflow(u64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledSample {
    /// Seconds on the device sample clock.
    pub timestamp: f64,
    pub channel: ChannelId,
    pub voltage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemuxOutput {
    /// Sample-frame by sample-frame, channels in ascending order within a frame.
    pub samples: Vec<ScaledSample>,
    /// The block does not continue the previous one.
    pub discontinuity: bool,
}

/// Anchor mapping device sample counters onto monotonic timestamps.
#[derive(Debug, Clone, Copy)]
struct Timebase {
    base_sequence: u64,
    base_time: f64,
    sample_rate: f64,
}

impl Timebase {
    fn timestamp(&self, sequence: u64) -> f64 {
        self.base_time + (sequence - self.base_sequence) as f64 / self.sample_rate
    }
}

#[derive(Debug)]
pub struct Demultiplexer {
    calibrations: Vec<Arc<dyn Calibration>>,
    timebase: Option<Timebase>,
    next_sequence: Option<u64>,
    /// End of the furthest block decoded so far; survives `reset`.
    high_water: Option<u64>,
    last_timestamp: Option<f64>,
}

impl Demultiplexer {
    /// One calibration per device channel.
    pub fn new(calibrations: Vec<Arc<dyn Calibration>>) -> Self {
        Self {
            calibrations,
            timebase: None,
            next_sequence: None,
            high_water: None,
            last_timestamp: None,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.calibrations.len()
    }

    /// Swap calibrations after a reconnect, keeping the timebase.
    pub fn set_calibrations(&mut self, calibrations: Vec<Arc<dyn Calibration>>) {
        self.calibrations = calibrations;
    }

    /// Forget the expected next sequence; the next block starts a new run. Timestamps keep
    /// increasing across the reset.
    pub fn reset(&mut self) {
        self.next_sequence = None;
    }

    fn validate(&self, block: &RawSampleBlock) -> Result<usize, DecodeError> {
        if block.channel_count != self.channel_count() {
            return Err(DecodeError::ChannelCountMismatch {
                block: block.channel_count,
                expected: self.channel_count(),
            });
        }
        if !(block.sample_rate.is_finite() && block.sample_rate > 0.0) {
            return Err(DecodeError::InvalidSampleRate(block.sample_rate));
        }
        if block.payload.is_empty() {
            return Err(DecodeError::EmptyBlock);
        }
        let frame_bytes = block.channel_count * RawSampleBlock::BYTES_PER_SAMPLE;
        if frame_bytes == 0 || block.payload.len() % frame_bytes != 0 {
            return Err(DecodeError::MisalignedPayload {
                len: block.payload.len(),
                frame_bytes,
            });
        }
        Ok(block.payload.len() / frame_bytes)
    }

    /// Re-anchor the timebase when the block does not continue the previous one.
    fn align(&mut self, block: &RawSampleBlock) -> bool {
        let same_rate = self
            .timebase
            .is_some_and(|tb| (tb.sample_rate - block.sample_rate).abs() < f64::EPSILON);
        if same_rate && self.next_sequence == Some(block.sequence) {
            return false;
        }
        if same_rate && self.high_water.is_some_and(|end| block.sequence >= end) {
            // Forward gap on the same clock: the gap shows in the timestamps.
            return true;
        }
        let base_time = self
            .last_timestamp
            .map_or(0.0, |last| last + 1.0 / block.sample_rate);
        let discontinuity = self.timebase.is_some();
        self.timebase = Some(Timebase {
            base_sequence: block.sequence,
            base_time,
            sample_rate: block.sample_rate,
        });
        discontinuity
    }

    /// Decode `block` using the current channel settings. The block is consumed; on error it is
    /// dropped and the expected sequence is left untouched.
    pub fn demux(
        &mut self,
        block: RawSampleBlock,
        channels: &[ChannelConfig],
    ) -> Result<DemuxOutput, DecodeError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("demux");

        let frames = self.validate(&block)?;
        let end = block
            .sequence
            .checked_add(frames as u64)
            .ok_or(DecodeError::SequenceOverflow(block.sequence))?;
        let discontinuity = self.align(&block);
        if discontinuity {
            log::debug!(
                "Sequence discontinuity: expected {:?}, got {}",
                self.next_sequence,
                block.sequence
            );
        }
        let Some(timebase) = self.timebase else {
            return Err(DecodeError::InvalidSampleRate(block.sample_rate));
        };

        let default_channel = ChannelConfig::default();
        let mut samples = Vec::with_capacity(frames * block.channel_count);
        let values = block
            .payload
            .chunks_exact(RawSampleBlock::BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]));

        for (position, counts) in values.enumerate() {
            let frame = (position / block.channel_count) as u64;
            let channel = position % block.channel_count;
            let config = channels.get(channel).unwrap_or(&default_channel);
            let voltage = self.calibrations[channel].counts_to_volts(i32::from(counts), config);
            samples.push(ScaledSample {
                timestamp: timebase.timestamp(block.sequence + frame),
                channel,
                voltage,
            });
        }

        self.next_sequence = Some(end);
        self.high_water = Some(self.high_water.map_or(end, |hw| hw.max(end)));
        self.last_timestamp = samples.last().map(|s| s.timestamp);
        Ok(DemuxOutput {
            samples,
            discontinuity,
        })
    }

    /// De-interleave raw counts without scaling, `[channel][frame]`. Used by calibration
    /// routines that need the unconverted ADC values.
    pub fn raw_counts(&self, block: &RawSampleBlock) -> Result<Vec<Vec<i32>>, DecodeError> {
        let frames = self.validate(block)?;
        let mut counts = vec![Vec::with_capacity(frames); block.channel_count];
        for (position, pair) in block
            .payload
            .chunks_exact(RawSampleBlock::BYTES_PER_SAMPLE)
            .enumerate()
        {
            counts[position % block.channel_count].push(i32::from(i16::from_le_bytes([
                pair[0], pair[1],
            ])));
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::LinearCalibration;

    fn demux(channels: usize) -> Demultiplexer {
        Demultiplexer::new(
            (0..channels)
                .map(|_| Arc::new(LinearCalibration::nominal(12)) as Arc<dyn Calibration>)
                .collect(),
        )
    }

    #[test]
    fn test_interleaved_decode_and_scale() {
        let mut demux = demux(2);
        let block = RawSampleBlock::from_counts(0, 1000.0, 2, [2048, -2048, 1024, 0]);
        let channels = [
            ChannelConfig::default(),
            ChannelConfig {
                volts_per_division: 2.0,
                ..ChannelConfig::default()
            },
        ];
        let out = demux.demux(block, &channels).unwrap();
        assert!(!out.discontinuity);
        let voltages: Vec<f64> = out.samples.iter().map(|s| s.voltage).collect();
        assert_eq!(voltages, vec![5.0, -10.0, 2.5, 0.0]);
        assert_eq!(out.samples[2].channel, 0);
        assert!((out.samples[2].timestamp - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_timestamps_monotonic_and_counts_match() {
        let mut demux = demux(2);
        let mut total = 0;
        let mut last = f64::NEG_INFINITY;
        let blocks = [
            RawSampleBlock::from_counts(0, 1000.0, 2, [1i16; 8]),
            RawSampleBlock::from_counts(4, 1000.0, 2, [1i16; 8]),
            // malformed: odd number of values
            RawSampleBlock::from_counts(8, 1000.0, 2, [1i16; 3]),
            RawSampleBlock::from_counts(8, 1000.0, 2, [1i16; 6]),
            // device restarted its counter
            RawSampleBlock::from_counts(0, 1000.0, 2, [1i16; 6]),
        ];
        let mut dropped = 0;
        for block in blocks {
            match demux.demux(block, &[]) {
                Ok(out) => {
                    for sample in &out.samples {
                        assert!(sample.timestamp >= last);
                        last = sample.timestamp;
                    }
                    total += out.samples.len();
                }
                Err(_) => dropped += 1,
            }
        }
        assert_eq!(dropped, 1);
        assert_eq!(total, 8 + 8 + 6 + 6);
    }

    #[test]
    fn test_gap_reports_discontinuity() {
        let mut demux = demux(1);
        let first = demux
            .demux(RawSampleBlock::from_counts(0, 100.0, 1, [0i16; 10]), &[])
            .unwrap();
        assert!(!first.discontinuity);
        let gap = demux
            .demux(RawSampleBlock::from_counts(50, 100.0, 1, [0i16; 10]), &[])
            .unwrap();
        assert!(gap.discontinuity);
        assert!((gap.samples[0].timestamp - 0.5).abs() < 1e-12);
        let next = demux
            .demux(RawSampleBlock::from_counts(60, 100.0, 1, [0i16; 10]), &[])
            .unwrap();
        assert!(!next.discontinuity);
    }

    #[test]
    fn test_reset_forces_discontinuity() {
        let mut demux = demux(1);
        demux
            .demux(RawSampleBlock::from_counts(0, 100.0, 1, [0i16; 4]), &[])
            .unwrap();
        demux.reset();
        let out = demux
            .demux(RawSampleBlock::from_counts(4, 100.0, 1, [0i16; 4]), &[])
            .unwrap();
        assert!(out.discontinuity);
    }

    #[test]
    fn test_malformed_blocks_rejected() {
        let mut demux = demux(2);
        assert_eq!(
            demux.demux(RawSampleBlock::from_counts(0, 100.0, 1, [0i16; 4]), &[]),
            Err(DecodeError::ChannelCountMismatch {
                block: 1,
                expected: 2
            })
        );
        assert_eq!(
            demux.demux(RawSampleBlock::from_counts(0, 100.0, 2, [0i16; 0]), &[]),
            Err(DecodeError::EmptyBlock)
        );
        assert_eq!(
            demux.demux(RawSampleBlock::from_counts(0, 0.0, 2, [0i16; 2]), &[]),
            Err(DecodeError::InvalidSampleRate(0.0))
        );
    }

    #[test]
    fn test_sequence_near_counter_end_is_dropped() {
        let mut demux = demux(1);
        demux
            .demux(RawSampleBlock::from_counts(0, 1000.0, 1, [0i16; 4]), &[])
            .unwrap();
        assert_eq!(
            demux.demux(
                RawSampleBlock::from_counts(u64::MAX - 1, 1000.0, 1, [0i16; 4]),
                &[]
            ),
            Err(DecodeError::SequenceOverflow(u64::MAX - 1))
        );
        // The stream continues as if the bad block never arrived.
        let next = demux
            .demux(RawSampleBlock::from_counts(4, 1000.0, 1, [0i16; 4]), &[])
            .unwrap();
        assert!(!next.discontinuity);
        assert!((next.samples[0].timestamp - 0.004).abs() < 1e-12);
    }

    #[test]
    fn test_raw_counts_deinterleave() {
        let demux = demux(2);
        let block = RawSampleBlock::from_counts(0, 100.0, 2, [1, 10, 2, 20, 3, 30]);
        assert_eq!(
            demux.raw_counts(&block).unwrap(),
            vec![vec![1, 2, 3], vec![10, 20, 30]]
        );
    }
}
