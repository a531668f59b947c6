//! Frame assembly around trigger events.

use crate::config::{ChannelConfig, ChannelId};
use crate::ring_buffer::{RingBufferBank, WindowError};
use crate::trigger::TriggerEvent;
use crate::trigger_config::TriggerConfig;
use polars::prelude::*;
use std::time::SystemTime;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("Window for channel {channel} was overwritten before assembly")]
    Stale { channel: ChannelId },

    #[error("Post-trigger samples not received yet")]
    NotReady,

    #[error("No channel is enabled")]
    NoEnabledChannels,

    #[error("Channel {0} is not captured by the device")]
    UnknownChannel(ChannelId),
}

const TIME_COLUMN_NAME: &str = "time";

/// One channel of a frame: `(relative_time, voltage)` pairs, time in seconds relative to the
/// trigger sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTrace {
    pub channel: ChannelId,
    pub samples: Vec<(f64, f64)>,
}

impl ChannelTrace {
    pub fn voltages(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|&(_, v)| v)
    }

    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|&(t, _)| t)
    }

    pub fn column_name(&self) -> String {
        format!("ch{}", self.channel)
    }
}

/// An immutable aligned capture of every enabled channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Counts up by one for every emitted frame.
    pub sequence: u64,
    pub channels: Vec<ChannelTrace>,
    /// Position of the trigger sample in each trace. Equals the frame length when the whole
    /// frame is pre-trigger.
    pub trigger_index: usize,
    /// Trigger time on the device sample clock.
    pub trigger_time: f64,
    pub sample_period: f64,
    pub free_run: bool,
    pub captured_at: SystemTime,
}

impl CapturedFrame {
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, |trace| trace.samples.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self, channel: ChannelId) -> Option<&ChannelTrace> {
        self.channels.iter().find(|trace| trace.channel == channel)
    }

    /// Columns `time` and one `ch<N>` per captured channel, for exporters.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.channels.len() + 1);
        let times: Vec<f64> = self
            .channels
            .first()
            .map(|trace| trace.times().collect())
            .unwrap_or_default();
        columns.push(Series::new(TIME_COLUMN_NAME.into(), times).into());
        for trace in &self.channels {
            let voltages: Vec<f64> = trace.voltages().collect();
            columns.push(Series::new(trace.column_name().into(), voltages).into());
        }
        DataFrame::new(columns)
    }
}

#[derive(Debug)]
pub struct FrameAssembler {
    frame_length: usize,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(frame_length: usize) -> Self {
        Self {
            frame_length,
            next_sequence: 0,
        }
    }

    /// Logical index one past the last sample of the event's window.
    pub fn window_end(&self, event: &TriggerEvent, trigger: &TriggerConfig) -> u64 {
        let (_, post) = trigger.split_frame(self.frame_length);
        event.logical_index + post as u64
    }

    pub fn is_ready(
        &self,
        bank: &RingBufferBank,
        event: &TriggerEvent,
        trigger: &TriggerConfig,
    ) -> bool {
        bank.next_index() >= self.window_end(event, trigger)
    }

    /// Copy the window `[index - pre, index + post)` of every enabled channel out of `bank`.
    /// Either every channel is captured or no frame is produced.
    pub fn assemble(
        &mut self,
        bank: &RingBufferBank,
        event: &TriggerEvent,
        trigger: &TriggerConfig,
        channels: &[ChannelConfig],
    ) -> Result<CapturedFrame, AssembleError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("assemble_frame");

        let enabled: Vec<ChannelId> = channels
            .iter()
            .enumerate()
            .filter(|(_, config)| config.enabled)
            .map(|(channel, _)| channel)
            .collect();
        if enabled.is_empty() {
            return Err(AssembleError::NoEnabledChannels);
        }

        let (pre, _) = trigger.split_frame(self.frame_length);
        let end = self.window_end(event, trigger);
        let mut traces = Vec::with_capacity(enabled.len());
        for channel in enabled {
            let window = bank
                .window(channel, end, self.frame_length)
                .map_err(|e| match e {
                    WindowError::Stale { .. } => AssembleError::Stale { channel },
                    WindowError::Pending { .. } => AssembleError::NotReady,
                    WindowError::UnknownChannel(channel) => AssembleError::UnknownChannel(channel),
                })?;
            traces.push(ChannelTrace {
                channel,
                samples: window
                    .iter()
                    .map(|s| (s.timestamp - event.timestamp, s.voltage))
                    .collect(),
            });
        }

        let sample_period = traces
            .first()
            .and_then(|trace| Some((trace.samples.first()?.0, trace.samples.last()?.0)))
            .map_or(0.0, |(first, last)| {
                (last - first) / (self.frame_length.saturating_sub(1).max(1)) as f64
            });

        let frame = CapturedFrame {
            sequence: self.next_sequence,
            channels: traces,
            trigger_index: pre,
            trigger_time: event.timestamp,
            sample_period,
            free_run: event.free_run,
            captured_at: SystemTime::now(),
        };
        self.next_sequence += 1;
        Ok(frame)
    }
}
