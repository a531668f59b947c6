//! Per-channel sample history.
//!
//! Each [`RingBuffer`] keeps the newest `capacity` samples of one channel and addresses them by
//! logical index: the n-th sample ever pushed has index n, regardless of how often the storage
//! has wrapped. A window request names logical indices and fails with
//! [`WindowError::Stale`] once any of them has been overwritten.

use crate::config::ChannelId;
use crate::demux::ScaledSample;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("Samples {start}..{end} were overwritten or flushed (oldest held is {oldest})")]
    Stale { start: u64, end: u64, oldest: u64 },

    #[error("Samples up to {end} are not written yet (next index is {next})")]
    Pending { end: u64, next: u64 },

    #[error("No ring buffer for channel {0}")]
    UnknownChannel(ChannelId),
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    timestamp: f64,
    voltage: f64,
}

#[derive(Debug)]
pub struct RingBuffer {
    channel: ChannelId,
    slots: Box<[Slot]>,
    /// Logical index the next push receives.
    next_index: u64,
    /// Indices below this were flushed by `clear`.
    valid_from: u64,
}

impl RingBuffer {
    pub fn new(channel: ChannelId, capacity: usize) -> Self {
        Self {
            channel,
            slots: vec![Slot::default(); capacity.max(1)].into_boxed_slice(),
            next_index: 0,
            valid_from: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Oldest logical index still held.
    pub fn oldest_index(&self) -> u64 {
        self.next_index
            .saturating_sub(self.slots.len() as u64)
            .max(self.valid_from)
    }

    pub fn len(&self) -> usize {
        (self.next_index - self.oldest_index()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.slots.len() as u64) as usize
    }

    /// Store a sample, overwriting the oldest one when full. Returns its logical index.
    pub fn push(&mut self, timestamp: f64, voltage: f64) -> u64 {
        let index = self.next_index;
        let slot = self.slot(index);
        self.slots[slot] = Slot { timestamp, voltage };
        self.next_index += 1;
        index
    }

    /// Invalidate everything held. Logical indices keep counting up.
    pub fn clear(&mut self) {
        self.valid_from = self.next_index;
    }

    /// The `length` samples ending just before `end_index`.
    pub fn window(&self, end_index: u64, length: usize) -> Result<Vec<ScaledSample>, WindowError> {
        let oldest = self.oldest_index();
        let Some(start) = end_index.checked_sub(length as u64) else {
            return Err(WindowError::Stale {
                start: 0,
                end: end_index,
                oldest,
            });
        };
        if end_index > self.next_index {
            return Err(WindowError::Pending {
                end: end_index,
                next: self.next_index,
            });
        }
        if start < oldest {
            return Err(WindowError::Stale {
                start,
                end: end_index,
                oldest,
            });
        }
        Ok((start..end_index)
            .map(|index| {
                let slot = self.slots[self.slot(index)];
                ScaledSample {
                    timestamp: slot.timestamp,
                    channel: self.channel,
                    voltage: slot.voltage,
                }
            })
            .collect())
    }
}

/// One ring buffer per device channel, written in lockstep.
#[derive(Debug)]
pub struct RingBufferBank {
    rings: Vec<RingBuffer>,
}

impl RingBufferBank {
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            rings: (0..channels)
                .map(|channel| RingBuffer::new(channel, capacity))
                .collect(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.rings.len()
    }

    pub fn capacity(&self) -> usize {
        self.rings.first().map_or(0, RingBuffer::capacity)
    }

    /// Append to the sample's channel. Returns `None` for a channel the bank does not have.
    pub fn push(&mut self, sample: ScaledSample) -> Option<u64> {
        self.rings
            .get_mut(sample.channel)
            .map(|ring| ring.push(sample.timestamp, sample.voltage))
    }

    /// Lowest next index over all channels, i.e. the end of the newest complete sample-frame.
    pub fn next_index(&self) -> u64 {
        self.rings
            .iter()
            .map(RingBuffer::next_index)
            .min()
            .unwrap_or(0)
    }

    pub fn ring(&self, channel: ChannelId) -> Option<&RingBuffer> {
        self.rings.get(channel)
    }

    pub fn window(
        &self,
        channel: ChannelId,
        end_index: u64,
        length: usize,
    ) -> Result<Vec<ScaledSample>, WindowError> {
        self.rings
            .get(channel)
            .ok_or(WindowError::UnknownChannel(channel))?
            .window(end_index, length)
    }

    pub fn clear(&mut self) {
        self.rings.iter_mut().for_each(RingBuffer::clear);
    }
}
