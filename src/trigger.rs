//! Edge trigger with hysteresis.
//!
//! The engine sees every sample of the source channel exactly once, in logical index order.
//! A rising trigger needs the signal below `level - hysteresis` (armed) before it fires at the
//! first sample at or above `level`; falling is the mirror image. After an event the engine holds
//! off for one frame length so consecutive frames never share samples.

use crate::config::ChannelId;
use crate::trigger_config::{Edge, TriggerConfig, TriggerMode};

/// A sample tagged with its ring buffer logical index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedSample {
    pub index: u64,
    pub channel: ChannelId,
    pub timestamp: f64,
    pub voltage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerEvent {
    pub channel: ChannelId,
    pub logical_index: u64,
    pub timestamp: f64,
    /// Synthesized by auto mode, not a genuine edge.
    pub free_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SingleShot {
    Armed,
    AwaitingFrame,
    Done,
}

/// Hysteresis state of the source channel.
#[derive(Debug, Clone, Copy, Default)]
struct EdgeDetector {
    armed: bool,
}

impl EdgeDetector {
    fn update(&mut self, config: &TriggerConfig, voltage: f64) -> bool {
        let (arming, firing) = match config.edge {
            Edge::Rising => (
                voltage < config.level - config.hysteresis,
                voltage >= config.level,
            ),
            Edge::Falling => (
                voltage > config.level + config.hysteresis,
                voltage <= config.level,
            ),
        };
        if arming {
            self.armed = true;
            return false;
        }
        if self.armed && firing {
            self.armed = false;
            return true;
        }
        false
    }
}

#[derive(Debug)]
pub struct TriggerEngine {
    config: TriggerConfig,
    frame_length: u64,
    detector: EdgeDetector,
    /// Next logical index to look at.
    next_index: u64,
    holdoff_until: u64,
    /// Sample-clock time of the last event, or of the first sample after a reset.
    last_event_time: Option<f64>,
    single: SingleShot,
}

impl TriggerEngine {
    pub fn new(config: TriggerConfig, frame_length: usize) -> Self {
        Self {
            config,
            frame_length: frame_length as u64,
            detector: EdgeDetector::default(),
            next_index: 0,
            holdoff_until: 0,
            last_event_time: None,
            single: SingleShot::Armed,
        }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Swap the configuration. Edge state is discarded. A completed single shot stays
    /// completed until [`TriggerEngine::rearm`]; switching into single mode starts armed.
    pub fn apply_config(&mut self, config: TriggerConfig) {
        if self.config.mode != TriggerMode::Single {
            self.single = SingleShot::Armed;
        }
        self.config = config;
        self.reset();
    }

    /// Drop all partial state, e.g. after a discontinuity. Scanning continues at the next
    /// unseen index; a completed single shot stays completed.
    pub fn reset(&mut self) {
        self.detector = EdgeDetector::default();
        self.holdoff_until = 0;
        self.last_event_time = None;
        if self.single == SingleShot::AwaitingFrame {
            self.single = SingleShot::Armed;
        }
    }

    /// Whether the next edge can produce an event.
    pub fn is_armed(&self) -> bool {
        self.config.mode != TriggerMode::Single || self.single == SingleShot::Armed
    }

    /// The frame for the last event was emitted.
    pub fn frame_completed(&mut self) {
        if self.single == SingleShot::AwaitingFrame {
            self.single = SingleShot::Done;
        }
    }

    /// The frame for the last event was stale; a single shot tries again.
    pub fn frame_discarded(&mut self) {
        if self.single == SingleShot::AwaitingFrame {
            self.single = SingleShot::Armed;
        }
    }

    pub fn rearm(&mut self) {
        self.single = SingleShot::Armed;
        self.holdoff_until = 0;
    }

    /// Scan `samples` for the next event. Samples already seen by an earlier call are skipped,
    /// so calling again with the same slice yields the following event, if any.
    pub fn scan(&mut self, samples: &[IndexedSample]) -> Option<TriggerEvent> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("trigger_scan");

        let source = self.config.source;
        let newest = samples
            .iter()
            .rev()
            .find(|s| s.channel == source)
            .copied();

        for sample in samples.iter().filter(|s| s.channel == source) {
            if sample.index < self.next_index {
                continue;
            }
            self.next_index = sample.index + 1;
            let reference = *self.last_event_time.get_or_insert(sample.timestamp);
            let fired = self.detector.update(&self.config, sample.voltage);

            if !self.is_armed() || sample.index < self.holdoff_until {
                continue;
            }
            if fired {
                return Some(self.fire(sample, false));
            }
            if self.config.mode == TriggerMode::Auto
                && sample.timestamp - reference >= self.config.auto_timeout.as_secs_f64()
            {
                let at = newest.unwrap_or(*sample);
                self.next_index = at.index + 1;
                return Some(self.fire(&at, true));
            }
        }
        None
    }

    fn fire(&mut self, sample: &IndexedSample, free_run: bool) -> TriggerEvent {
        self.holdoff_until = sample.index + self.frame_length;
        self.last_event_time = Some(sample.timestamp);
        if self.config.mode == TriggerMode::Single {
            self.single = SingleShot::AwaitingFrame;
        }
        if free_run {
            // An edge straddling the free-run point must not fire inside its frame.
            self.detector.armed = false;
        }
        TriggerEvent {
            channel: sample.channel,
            logical_index: sample.index,
            timestamp: sample.timestamp,
            free_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const RATE: f64 = 1000.0;

    fn samples(start: u64, voltages: &[f64]) -> Vec<IndexedSample> {
        voltages
            .iter()
            .enumerate()
            .map(|(i, &voltage)| {
                let index = start + i as u64;
                IndexedSample {
                    index,
                    channel: 0,
                    timestamp: index as f64 / RATE,
                    voltage,
                }
            })
            .collect()
    }

    fn drain(engine: &mut TriggerEngine, block: &[IndexedSample]) -> Vec<TriggerEvent> {
        std::iter::from_fn(|| engine.scan(block)).collect()
    }

    #[test]
    fn test_rising_edge_index() {
        let config = TriggerConfig::start_capturing_when(0)
            .normal()
            .with_hysteresis(0.1)
            .rising_edge(1.0);
        let mut engine = TriggerEngine::new(config, 2);
        let block = samples(0, &[0.0, 0.5, 0.99, 1.0, 1.5, 2.0]);
        let events = drain(&mut engine, &block);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].logical_index, 3);
        assert!(!events[0].free_run);
    }

    #[test]
    fn test_falling_edge() {
        let config = TriggerConfig::start_capturing_when(0)
            .normal()
            .with_hysteresis(0.1)
            .falling_edge(1.0);
        let mut engine = TriggerEngine::new(config, 2);
        let block = samples(0, &[2.0, 1.5, 1.0, 0.0, 0.5, 2.0, 0.9]);
        let events: Vec<u64> = drain(&mut engine, &block)
            .iter()
            .map(|e| e.logical_index)
            .collect();
        assert_eq!(events, vec![2, 6]);
    }

    #[test]
    fn test_noise_inside_band_fires_once() {
        let config = TriggerConfig::start_capturing_when(0)
            .normal()
            .with_hysteresis(0.2)
            .rising_edge(1.0);
        let mut engine = TriggerEngine::new(config, 2);
        let block = samples(
            0,
            &[0.5, 1.0, 0.85, 1.05, 0.81, 1.1, 0.9, 1.0, 0.7, 1.0],
        );
        let events: Vec<u64> = drain(&mut engine, &block)
            .iter()
            .map(|e| e.logical_index)
            .collect();
        assert_eq!(events, vec![1, 9]);
    }

    #[test]
    fn test_starts_above_level_does_not_fire() {
        let config = TriggerConfig::start_capturing_when(0)
            .normal()
            .rising_edge(1.0);
        let mut engine = TriggerEngine::new(config, 2);
        assert_eq!(engine.scan(&samples(0, &[2.0, 2.0, 1.5])), None);
    }

    #[test]
    fn test_multiple_events_per_block_with_holdoff() {
        let config = TriggerConfig::start_capturing_when(0)
            .normal()
            .with_hysteresis(0.1)
            .rising_edge(0.5);
        let mut engine = TriggerEngine::new(config, 4);
        // Square wave with period 4: edges at 2, 6, 10, 14.
        let voltages: Vec<f64> = (0..16).map(|i| if i % 4 < 2 { 0.0 } else { 1.0 }).collect();
        let block = samples(0, &voltages);
        let events: Vec<u64> = drain(&mut engine, &block)
            .iter()
            .map(|e| e.logical_index)
            .collect();
        assert_eq!(events, vec![2, 6, 10, 14]);

        // Frame longer than the period skips every other edge.
        let config = TriggerConfig::start_capturing_when(0)
            .normal()
            .with_hysteresis(0.1)
            .rising_edge(0.5);
        let mut engine = TriggerEngine::new(config, 6);
        let events: Vec<u64> = drain(&mut engine, &block)
            .iter()
            .map(|e| e.logical_index)
            .collect();
        assert_eq!(events, vec![2, 10]);
    }

    #[test]
    fn test_other_channels_ignored() {
        let config = TriggerConfig::start_capturing_when(1)
            .normal()
            .rising_edge(0.5);
        let mut engine = TriggerEngine::new(config, 2);
        let mut block = samples(0, &[0.0, 1.0, 0.0, 1.0]);
        assert_eq!(engine.scan(&block), None);
        for sample in &mut block {
            sample.channel = 1;
            sample.index += 4;
        }
        assert_eq!(engine.scan(&block).map(|e| e.logical_index), Some(5));
    }

    #[test]
    fn test_auto_one_free_run_per_timeout() {
        let timeout = Duration::from_millis(100);
        let config = TriggerConfig::start_capturing_when(0)
            .auto(timeout)
            .rising_edge(1.0);
        let mut engine = TriggerEngine::new(config, 10);
        let mut events = Vec::new();
        for block_start in (0..1000).step_by(10) {
            let block = samples(block_start, &[0.0; 10]);
            events.extend(drain(&mut engine, &block));
        }
        assert!(events.iter().all(|e| e.free_run));
        assert!((8..=10).contains(&events.len()), "{} events", events.len());
        for pair in events.windows(2) {
            let gap = pair[1].timestamp - pair[0].timestamp;
            assert!(gap > 0.099 && gap < 0.121, "gap {gap}");
        }
        // Free-run lands on the newest sample of the block.
        assert!(events.iter().all(|e| e.logical_index % 10 == 9));
    }

    #[test]
    fn test_auto_quiet_while_triggering() {
        let config = TriggerConfig::start_capturing_when(0)
            .auto(Duration::from_millis(100))
            .with_hysteresis(0.1)
            .rising_edge(0.5);
        let mut engine = TriggerEngine::new(config, 10);
        // 50 Hz square wave at 1 kHz: an edge every 20 samples.
        let voltages: Vec<f64> = (0..1000)
            .map(|i| if i % 20 < 10 { 0.0 } else { 1.0 })
            .collect();
        let events = drain(&mut engine, &samples(0, &voltages));
        assert_eq!(events.len(), 50);
        assert!(events.iter().all(|e| !e.free_run));
    }

    #[test]
    fn test_single_waits_for_rearm() {
        let config = TriggerConfig::start_capturing_when(0)
            .single()
            .rising_edge(0.5);
        let mut engine = TriggerEngine::new(config, 2);
        let square = [0.0, 1.0, 0.0, 1.0, 0.0, 1.0];

        assert!(engine.is_armed());
        let block = samples(0, &square);
        assert_eq!(engine.scan(&block).map(|e| e.logical_index), Some(1));
        assert!(!engine.is_armed());
        engine.frame_completed();
        assert_eq!(engine.scan(&block), None);
        assert_eq!(engine.scan(&samples(6, &square)), None);

        engine.rearm();
        assert_eq!(engine.scan(&samples(12, &square)).map(|e| e.logical_index), Some(13));
    }

    #[test]
    fn test_single_retries_after_discarded_frame() {
        let config = TriggerConfig::start_capturing_when(0)
            .single()
            .rising_edge(0.5);
        let mut engine = TriggerEngine::new(config, 2);
        let block = samples(0, &[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        assert!(engine.scan(&block).is_some());
        engine.frame_discarded();
        assert_eq!(engine.scan(&block).map(|e| e.logical_index), Some(3));
    }

    #[test]
    fn test_config_change_keeps_single_shot_done() {
        let single = || TriggerConfig::start_capturing_when(0).single();
        let mut engine = TriggerEngine::new(single().rising_edge(0.5), 2);
        let square = [0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
        assert!(engine.scan(&samples(0, &square)).is_some());
        engine.frame_completed();

        engine.apply_config(single().rising_edge(0.4));
        assert!(!engine.is_armed());
        assert_eq!(engine.scan(&samples(6, &square)), None);

        engine.rearm();
        assert_eq!(engine.scan(&samples(12, &square)).map(|e| e.logical_index), Some(13));
    }

    #[test]
    fn test_switching_into_single_mode_arms() {
        let normal = TriggerConfig::start_capturing_when(0).normal().rising_edge(0.5);
        let mut engine = TriggerEngine::new(normal, 2);
        engine.apply_config(TriggerConfig::start_capturing_when(0).single().rising_edge(0.5));
        assert!(engine.is_armed());
        assert_eq!(engine.scan(&samples(0, &[0.0, 1.0])).map(|e| e.logical_index), Some(1));
    }

    #[test]
    fn test_reset_requires_fresh_arming() {
        let config = TriggerConfig::start_capturing_when(0)
            .normal()
            .with_hysteresis(0.1)
            .rising_edge(0.5);
        let mut engine = TriggerEngine::new(config, 2);
        assert_eq!(engine.scan(&samples(0, &[0.0, 0.0])), None);
        engine.reset();
        // Armed state from before the reset is gone.
        assert_eq!(engine.scan(&samples(2, &[1.0, 0.0, 1.0])).map(|e| e.logical_index), Some(4));
    }
}
