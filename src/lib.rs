//! # WhoaScope
//!
//! Acquisition and trigger engine for WhoaScope USB oscilloscopes.
//!
//! The engine owns the device connection, turns the continuous raw sample stream into scaled
//! per-channel samples, detects trigger events, and hands out aligned capture frames together
//! with voltmeter readings. Device disconnects are survived by flushing all buffered data and
//! reconnecting with backoff.
//!
//! ## Features
//!
//! - **Device discovery**: Uses `serialport` for finding scopes by USB vendor/product id
//! - **Edge triggering**: Rising/falling edges with hysteresis, normal/auto/single modes
//! - **Bounded memory**: Fixed-size ring buffers and a drop-oldest frame queue
//! - **Voltmeter**: RMS, peak-to-peak, mean, frequency and duty cycle per frame
//! - **DataFrame output**: Captured frames export to `polars` for external exporters
//! - **Simulator**: A software device with fault injection for demos and tests
//!
//! ## Examples
//!
//! ### Streaming from a simulated device
//!
//! ```rust,no_run
//! use whoascope::engine;
//! use whoascope::settings::Settings;
//! use whoascope::simulator::{SimulatedConnector, SimulatorConfig};
//! use whoascope::{DeviceSelector, TriggerConfig};
//! use std::time::Duration;
//!
//! let settings = Settings {
//!     trigger: TriggerConfig::start_capturing_when(0)
//!         .with_hysteresis(0.1)
//!         .rising_edge(0.0),
//!     ..Settings::default()
//! };
//! let connector = SimulatedConnector::new(SimulatorConfig::default());
//! let engine = engine::spawn(Box::new(connector), DeviceSelector::any(), settings)?;
//!
//! let output = engine.frames().recv_timeout(Duration::from_secs(1))?;
//! for (channel, reading) in &output.readings {
//!     println!("ch{}: {:.3} V rms, {:?} Hz", channel, reading.rms, reading.frequency);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Trigger configuration
//!
//! ```rust
//! use whoascope::trigger_config::{Edge, TriggerConfig, TriggerMode};
//!
//! let trigger = TriggerConfig::start_capturing_when(1)
//!     .with_hysteresis(0.05)
//!     .pre_trigger(0.25)
//!     .single()
//!     .falling_edge(1.65);
//!
//! assert_eq!(trigger.edge, Edge::Falling);
//! assert_eq!(trigger.mode, TriggerMode::Single);
//! assert_eq!(trigger.split_frame(1000), (250, 750));
//! ```
//!
//! ### Device Discovery
//!
//! ```rust,no_run
//! use whoascope::device_connector::SerialConnector;
//!
//! for device in SerialConnector::available_devices()? {
//!     println!("Found {} '{}' at {}", device.family, device.name, device.port);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod calibration;
pub mod config;
pub mod demux;
pub mod device;
pub mod device_connector;
pub mod device_link;
pub mod engine;
pub mod frame;
pub mod handoff;
pub mod ring_buffer;
pub mod serial_terminal;
pub mod settings;
pub mod simulator;
pub mod trigger;
pub mod trigger_config;
pub mod voltmeter;

// Re-export the main types for convenience
pub use calibration::{Calibration, CalibrationError, LinearCalibration};

pub use config::{AcquisitionConfig, ChannelConfig, ChannelId, ConfigError, Coupling};

pub use device::{ConnectionEvent, ConnectionState, DeviceFamily, DeviceSelector};

pub use device_link::{ConnectError, Connector, DeviceLink, LinkError, Transport};

pub use engine::{spawn, DiagnosticsSnapshot, EngineError, EngineHandle, FrameOutput};

pub use frame::{CapturedFrame, ChannelTrace};

pub use trigger_config::{Edge, TriggerConfig, TriggerMode};

pub use voltmeter::{VoltmeterReading, Voltmeter};
