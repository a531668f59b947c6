//! Device identity, capabilities and connection state.

use crate::calibration::{Calibration, LinearCalibration};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Connection state of the device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Faulted,
}

/// Emitted on every state transition of the device link.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Faulted(String),
    /// Reconnection gave up; an explicit reconnect is required.
    PersistentFailure { attempts: u32 },
}

impl ConnectionEvent {
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            ConnectionEvent::Disconnected => Some(ConnectionState::Disconnected),
            ConnectionEvent::Connecting => Some(ConnectionState::Connecting),
            ConnectionEvent::Connected => Some(ConnectionState::Connected),
            ConnectionEvent::Streaming => Some(ConnectionState::Streaming),
            ConnectionEvent::Faulted(_) => Some(ConnectionState::Faulted),
            ConnectionEvent::PersistentFailure { .. } => None,
        }
    }
}

/// Supported hardware families. Each one fixes the channel count, resolution and nominal
/// calibration of the device; the family is chosen at connect time from the USB ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    /// Two-channel RP2040 based scope.
    WhoaScope,
    /// Four-channel STM32 based scope.
    WhoaScopePro,
    /// Software device from [`crate::simulator`].
    Simulated,
}

impl DeviceFamily {
    const USB_IDS: [(u16, u16, DeviceFamily); 3] = [
        (0x2e8a, 0x000a, DeviceFamily::WhoaScope),
        (0x2e8a, 0x0009, DeviceFamily::WhoaScope),
        (0x0483, 0x5740, DeviceFamily::WhoaScopePro),
    ];

    pub fn from_usb_ids(vid: u16, pid: u16) -> Option<Self> {
        Self::USB_IDS
            .iter()
            .find(|(v, p, _)| *v == vid && *p == pid)
            .map(|(_, _, family)| *family)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFamily::WhoaScope => "WhoaScope",
            DeviceFamily::WhoaScopePro => "WhoaScope Pro",
            DeviceFamily::Simulated => "Simulator",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let ranges = vec![0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0];
        match self {
            DeviceFamily::WhoaScope => Capabilities {
                max_sample_rate: 500_000.0,
                channel_count: 2,
                resolution_bits: 12,
                volts_per_division: ranges,
            },
            DeviceFamily::WhoaScopePro => Capabilities {
                max_sample_rate: 2_000_000.0,
                channel_count: 4,
                resolution_bits: 12,
                volts_per_division: ranges,
            },
            DeviceFamily::Simulated => Capabilities {
                max_sample_rate: 10_000_000.0,
                channel_count: 4,
                resolution_bits: 16,
                volts_per_division: ranges,
            },
        }
    }

    pub fn nominal_calibration(&self) -> LinearCalibration {
        LinearCalibration::nominal(self.capabilities().resolution_bits)
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub max_sample_rate: f64,
    pub channel_count: usize,
    pub resolution_bits: u8,
    /// Selectable volts/division settings of the front end.
    pub volts_per_division: Vec<f64>,
}

/// Which device to connect to. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelector {
    pub name: Option<String>,
    pub port: Option<String>,
}

impl DeviceSelector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn by_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            port: None,
        }
    }

    pub fn by_port(port: &str) -> Self {
        Self {
            name: None,
            port: Some(port.to_string()),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.port) {
            (None, None) => f.write_str("any device"),
            (Some(name), None) => write!(f, "{name}"),
            (None, Some(port)) => write!(f, "{port}"),
            (Some(name), Some(port)) => write!(f, "{name} at {port}"),
        }
    }
}

/// What the device reported during the connect handshake.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub family: DeviceFamily,
    pub name: String,
    pub port: String,
    pub firmware: String,
    pub capabilities: Capabilities,
    /// Rate the device streams at, in samples per second per channel.
    pub sample_rate: f64,
    /// One entry per channel.
    pub calibrations: Vec<Arc<dyn Calibration>>,
}

impl DeviceInfo {
    pub fn channel_count(&self) -> usize {
        self.capabilities.channel_count
    }
}

/// A successful connection. `session` increases with every connect, so frames and events can
/// be told apart across reconnects.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub info: DeviceInfo,
    pub session: u64,
}

/// One transfer worth of raw samples.
///
/// The payload is interleaved little-endian `i16` ADC counts: one value per channel for every
/// sample instant, `channel_count` values per sample-frame.
#[derive(Debug, Clone)]
pub struct RawSampleBlock {
    /// Device sample counter of the first sample-frame in the payload.
    pub sequence: u64,
    pub sample_rate: f64,
    pub channel_count: usize,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

impl RawSampleBlock {
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Encode counts laid out as `[frame][channel]`.
    pub fn from_counts(
        sequence: u64,
        sample_rate: f64,
        channel_count: usize,
        counts: impl IntoIterator<Item = i16>,
    ) -> Self {
        let payload = counts.into_iter().flat_map(i16::to_le_bytes).collect();
        Self {
            sequence,
            sample_rate,
            channel_count,
            payload,
            received_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_usb_ids() {
        assert_eq!(
            DeviceFamily::from_usb_ids(0x0483, 0x5740),
            Some(DeviceFamily::WhoaScopePro)
        );
        assert_eq!(DeviceFamily::from_usb_ids(0x0403, 0x6001), None);
    }

    #[test]
    fn test_selector_display() {
        assert_eq!(DeviceSelector::any().to_string(), "any device");
        assert_eq!(DeviceSelector::by_port("/dev/ttyACM0").to_string(), "/dev/ttyACM0");
    }

    #[test]
    fn test_block_encoding() {
        let block = RawSampleBlock::from_counts(7, 1000.0, 2, [1i16, -2, 3, -4]);
        assert_eq!(block.payload, vec![1, 0, 0xfe, 0xff, 3, 0, 0xfc, 0xff]);
    }
}
