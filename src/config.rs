//! Channel and acquisition configuration.
//!
//! These are supplied by the external UI layer and read by the acquisition loop between
//! scan cycles. Every struct is serde-serializable so it can live in the persisted
//! [`Settings`](crate::settings::Settings) document.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Zero-based channel number as reported by the device.
pub type ChannelId = usize;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Frame length must be at least 2 samples (got {0})")]
    InvalidFrameLength(usize),

    #[error("Ring capacity {capacity} is too small, need at least {required} samples")]
    RingTooSmall { capacity: usize, required: usize },

    #[error("Handoff queue capacity must be at least 1")]
    InvalidQueueCapacity,

    #[error("Channel {channel}: {reason}")]
    InvalidChannel {
        channel: ChannelId,
        reason: &'static str,
    },

    #[error("Trigger: {0}")]
    InvalidTrigger(&'static str),

    #[error("Channel {channel} does not exist, device has {available} channels")]
    UnknownChannel {
        channel: ChannelId,
        available: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Coupling {
    #[default]
    Dc,
    Ac,
    Ground,
}

impl Coupling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coupling::Dc => "dc",
            Coupling::Ac => "ac",
            Coupling::Ground => "gnd",
        }
    }
}

/// Per-channel vertical settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub volts_per_division: f64,
    /// Added to every scaled sample, in volts.
    pub offset: f64,
    pub enabled: bool,
    pub coupling: Coupling,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            volts_per_division: 1.0,
            offset: 0.0,
            enabled: true,
            coupling: Coupling::Dc,
        }
    }
}

impl ChannelConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self, channel: ChannelId) -> Result<(), ConfigError> {
        if !(self.volts_per_division.is_finite() && self.volts_per_division > 0.0) {
            return Err(ConfigError::InvalidChannel {
                channel,
                reason: "volts/division must be a positive number",
            });
        }
        if !self.offset.is_finite() {
            return Err(ConfigError::InvalidChannel {
                channel,
                reason: "offset must be finite",
            });
        }
        Ok(())
    }
}

/// Exponential backoff used by the device link when a connection attempt fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1600),
            max_retries: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based): initial, 2×initial, 4×initial, … capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Sizing of the acquisition pipeline.
///
/// The ring buffer bank keeps `ring_capacity` samples per channel, which spans
/// `ring_capacity / fs` seconds at sample rate `fs`. Frames are assembled right after the
/// block that completes them is pushed, so the capacity only has to cover one frame plus one
/// block: `ring_capacity >= frame_length + max_block_samples`. Any extra capacity is slack for
/// assembly latency; see [`AcquisitionConfig::max_sample_rate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Samples per channel in one captured frame (`W`).
    pub frame_length: usize,
    /// Samples per channel held by each ring buffer (`N`).
    pub ring_capacity: usize,
    pub read_timeout: Duration,
    /// Completed frames held for the consumer before the oldest is dropped.
    pub queue_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            frame_length: 1000,
            ring_capacity: 1 << 16,
            read_timeout: Duration::from_millis(100),
            queue_capacity: 4,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl AcquisitionConfig {
    pub fn validate(&self, max_block_samples: usize) -> Result<(), ConfigError> {
        if self.frame_length < 2 {
            return Err(ConfigError::InvalidFrameLength(self.frame_length));
        }
        let required = self.frame_length.saturating_add(max_block_samples);
        if self.ring_capacity < required {
            return Err(ConfigError::RingTooSmall {
                capacity: self.ring_capacity,
                required,
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        Ok(())
    }

    /// Time span covered by one ring buffer at the given sample rate.
    pub fn history_span(&self, sample_rate: f64) -> Duration {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.ring_capacity as f64 / sample_rate)
            .unwrap_or(Duration::MAX)
    }

    /// Highest sample rate at which a trigger candidate survives `assembly_latency` before its
    /// pre-trigger history is overwritten. There is no lower bound: slower streams only make the
    /// history span longer.
    pub fn max_sample_rate(&self, assembly_latency: Duration) -> f64 {
        let slack = self.ring_capacity.saturating_sub(self.frame_length) as f64;
        let latency = assembly_latency.as_secs_f64();
        if latency <= 0.0 {
            return f64::INFINITY;
        }
        slack / latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(10), Duration::from_millis(1600));
        assert_eq!(policy.backoff(40), Duration::from_millis(1600));
    }

    #[test]
    fn test_ring_must_cover_frame_and_block() {
        let config = AcquisitionConfig {
            frame_length: 1000,
            ring_capacity: 1500,
            ..AcquisitionConfig::default()
        };
        assert_eq!(
            config.validate(600),
            Err(ConfigError::RingTooSmall {
                capacity: 1500,
                required: 1600
            })
        );
        assert!(config.validate(500).is_ok());
    }

    #[test]
    fn test_history_and_rate_bounds() {
        let config = AcquisitionConfig {
            frame_length: 1000,
            ring_capacity: 11_000,
            ..AcquisitionConfig::default()
        };
        let span = config.history_span(1_000_000.0).as_secs_f64();
        assert!((span - 0.011).abs() < 1e-9);
        assert_eq!(config.history_span(f64::NAN), Duration::ZERO);
        assert_eq!(config.history_span(f64::INFINITY), Duration::ZERO);
        assert_eq!(config.history_span(-1.0), Duration::ZERO);
        assert_eq!(config.history_span(1e-300), Duration::MAX);
        let rate = config.max_sample_rate(Duration::from_millis(10));
        assert!((rate - 1_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_channel_validation() {
        assert!(ChannelConfig::default().validate(0).is_ok());
        let bad = ChannelConfig {
            volts_per_division: 0.0,
            ..ChannelConfig::default()
        };
        assert!(matches!(
            bad.validate(1),
            Err(ConfigError::InvalidChannel { channel: 1, .. })
        ));
    }
}
