use crate::config::{ChannelId, ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Edge {
    #[default]
    Rising,
    Falling,
}

impl Edge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edge::Rising => "+",
            Edge::Falling => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Frames only on genuine trigger events.
    Normal,
    /// Same as normal, but free-runs when nothing triggered within the auto timeout.
    #[default]
    Auto,
    /// One frame, then wait for an explicit rearm.
    Single,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Normal => "normal",
            TriggerMode::Auto => "auto",
            TriggerMode::Single => "single",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub source: ChannelId,
    pub edge: Edge,
    /// Volts.
    pub level: f64,
    /// Width of the re-arm band below (rising) or above (falling) the level, in volts.
    pub hysteresis: f64,
    pub mode: TriggerMode,
    /// Share of the frame taken before the trigger point, 0.0..=1.0.
    pub pre_trigger_fraction: f64,
    pub auto_timeout: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: 0,
            edge: Edge::Rising,
            level: 0.0,
            hysteresis: 0.05,
            mode: TriggerMode::Auto,
            pre_trigger_fraction: 0.5,
            auto_timeout: Duration::from_millis(100),
        }
    }
}

impl TriggerConfig {
    pub fn start_capturing_when(source: ChannelId) -> TriggerBuilder {
        TriggerBuilder {
            config: TriggerConfig {
                source,
                ..TriggerConfig::default()
            },
        }
    }

    pub fn validate(&self, channel_count: usize) -> Result<(), ConfigError> {
        if self.source >= channel_count {
            return Err(ConfigError::UnknownChannel {
                channel: self.source,
                available: channel_count,
            });
        }
        if !self.level.is_finite() {
            return Err(ConfigError::InvalidTrigger("level must be finite"));
        }
        if !(self.hysteresis.is_finite() && self.hysteresis >= 0.0) {
            return Err(ConfigError::InvalidTrigger(
                "hysteresis must be a non-negative number",
            ));
        }
        if !(0.0..=1.0).contains(&self.pre_trigger_fraction) {
            return Err(ConfigError::InvalidTrigger(
                "pre-trigger fraction must be between 0 and 1",
            ));
        }
        if self.mode == TriggerMode::Auto && self.auto_timeout.is_zero() {
            return Err(ConfigError::InvalidTrigger("auto timeout must be non-zero"));
        }
        Ok(())
    }

    /// Split a frame of `frame_length` samples into `(pre, post)` around the trigger sample.
    /// The trigger sample itself is the first post-trigger sample.
    pub fn split_frame(&self, frame_length: usize) -> (usize, usize) {
        let fraction = self.pre_trigger_fraction.clamp(0.0, 1.0);
        let pre = ((fraction * frame_length as f64).round() as usize).min(frame_length);
        (pre, frame_length - pre)
    }
}

#[derive(Debug)]
pub struct TriggerBuilder {
    config: TriggerConfig,
}

impl TriggerBuilder {
    pub fn with_hysteresis(mut self, volts: f64) -> Self {
        self.config.hysteresis = volts;
        self
    }

    pub fn pre_trigger(mut self, fraction: f64) -> Self {
        self.config.pre_trigger_fraction = fraction;
        self
    }

    pub fn normal(mut self) -> Self {
        self.config.mode = TriggerMode::Normal;
        self
    }

    /// Free-run when nothing triggered within `timeout`.
    pub fn auto(mut self, timeout: Duration) -> Self {
        self.config.mode = TriggerMode::Auto;
        self.config.auto_timeout = timeout;
        self
    }

    pub fn single(mut self) -> Self {
        self.config.mode = TriggerMode::Single;
        self
    }

    pub fn rising_edge(mut self, level: f64) -> TriggerConfig {
        self.config.edge = Edge::Rising;
        self.config.level = level;
        self.config
    }

    pub fn falling_edge(mut self, level: f64) -> TriggerConfig {
        self.config.edge = Edge::Falling;
        self.config.level = level;
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = TriggerConfig::start_capturing_when(1)
            .with_hysteresis(0.2)
            .pre_trigger(0.25)
            .single()
            .falling_edge(1.5);
        assert_eq!(config.source, 1);
        assert_eq!(config.edge, Edge::Falling);
        assert_eq!(config.mode, TriggerMode::Single);
        assert_eq!(config.level, 1.5);
        assert_eq!(config.hysteresis, 0.2);
        assert!(config.validate(2).is_ok());
    }

    #[test]
    fn test_validate() {
        let config = TriggerConfig::start_capturing_when(2).rising_edge(0.0);
        assert_eq!(
            config.validate(2),
            Err(ConfigError::UnknownChannel {
                channel: 2,
                available: 2
            })
        );
        let config = TriggerConfig::start_capturing_when(0)
            .pre_trigger(1.5)
            .rising_edge(0.0);
        assert!(matches!(
            config.validate(2),
            Err(ConfigError::InvalidTrigger(_))
        ));
        let config = TriggerConfig::start_capturing_when(0)
            .auto(Duration::ZERO)
            .rising_edge(0.0);
        assert!(config.validate(2).is_err());
    }

    #[test]
    fn test_split_frame() {
        let config = TriggerConfig::start_capturing_when(0)
            .pre_trigger(0.5)
            .rising_edge(0.0);
        assert_eq!(config.split_frame(500), (250, 250));
        let config = TriggerConfig::start_capturing_when(0)
            .pre_trigger(0.1)
            .rising_edge(0.0);
        assert_eq!(config.split_frame(1001), (100, 901));
        let config = TriggerConfig::start_capturing_when(0)
            .pre_trigger(1.0)
            .rising_edge(0.0);
        assert_eq!(config.split_frame(10), (10, 0));
    }
}
