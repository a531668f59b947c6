//! Connection lifecycle of an acquisition device.
//!
//! [`DeviceLink`] owns the transport to one device and drives the state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Streaming -> Faulted -> Disconnected
//! ```
//!
//! Every transition is published as a [`ConnectionEvent`]. Backends plug in through the
//! [`Connector`] and [`Transport`] traits; the serial backend lives in
//! [`crate::device_connector`], the software device in [`crate::simulator`].

use crate::config::{ChannelConfig, ReconnectPolicy};
use crate::device::{
    ConnectionEvent, ConnectionState, DeviceHandle, DeviceInfo, DeviceSelector, RawSampleBlock,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of backoff sleeps; cancellation is noticed within one slice.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("No device matching {selector} found")]
    DeviceNotFound { selector: String },

    #[error("Port {port} is not a supported acquisition device")]
    InvalidPort { port: String },

    #[error("Permission denied opening {port}")]
    PermissionDenied { port: String },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("No device was selected before reconnecting")]
    NoSelector,

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Giving up after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("No sample block arrived within {0:?}")]
    Timeout(Duration),

    #[error("Device unplugged")]
    Unplugged,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Link is not streaming (state {0:?})")]
    NotStreaming(ConnectionState),
}

impl LinkError {
    /// Whether the error should fault the link. Timeouts are an ordinary empty read.
    pub fn is_fault(&self) -> bool {
        !matches!(self, LinkError::Timeout(_))
    }
}

/// An open, byte-level connection to a device.
pub trait Transport: Send {
    fn handshake(&mut self) -> Result<DeviceInfo, LinkError>;

    fn start_streaming(&mut self, channels: &[ChannelConfig]) -> Result<(), LinkError>;

    fn stop_streaming(&mut self) -> Result<(), LinkError>;

    /// Block for at most `timeout` until the next sample block arrives.
    fn read_block(&mut self, timeout: Duration) -> Result<RawSampleBlock, LinkError>;

    /// Release the device. Errors are not reported; the transport is dropped afterwards.
    fn close(&mut self) {}
}

/// Finds and opens devices.
pub trait Connector: Send {
    fn open(&mut self, selector: &DeviceSelector) -> Result<Box<dyn Transport>, ConnectError>;
}

/// Read-only view of the link state for other threads.
#[derive(Debug, Clone, Default)]
pub struct StateWatch(Arc<Mutex<ConnectionState>>);

impl StateWatch {
    pub fn get(&self) -> ConnectionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: ConnectionState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Sleep for `duration`, returning `false` early if `cancel` is raised.
pub(crate) fn sleep_cancellable(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Reject handshake values the pipeline cannot work with.
fn check_info(info: DeviceInfo) -> Result<DeviceInfo, LinkError> {
    if !(info.sample_rate.is_finite() && info.sample_rate > 0.0) {
        return Err(LinkError::Protocol(format!(
            "invalid sample rate {}",
            info.sample_rate
        )));
    }
    if info.calibrations.len() != info.channel_count() {
        return Err(LinkError::Protocol(format!(
            "{} calibrations for {} channels",
            info.calibrations.len(),
            info.channel_count()
        )));
    }
    Ok(info)
}

pub struct DeviceLink {
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    handle: Option<DeviceHandle>,
    selector: Option<DeviceSelector>,
    state: ConnectionState,
    watch: StateWatch,
    events: Sender<ConnectionEvent>,
    policy: ReconnectPolicy,
    sessions: u64,
    /// Connect attempts since streaming last started; bounded by the reconnect policy.
    attempts: u32,
    last_failure: String,
}

impl DeviceLink {
    pub fn new(
        connector: Box<dyn Connector>,
        policy: ReconnectPolicy,
        events: Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            connector,
            transport: None,
            handle: None,
            selector: None,
            state: ConnectionState::Disconnected,
            watch: StateWatch::default(),
            events,
            policy,
            sessions: 0,
            attempts: 0,
            last_failure: String::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn watch(&self) -> StateWatch {
        self.watch.clone()
    }

    pub fn handle(&self) -> Option<&DeviceHandle> {
        self.handle.as_ref()
    }

    fn emit(&self, event: ConnectionEvent) {
        // A consumer that went away does not stop acquisition.
        let _ = self.events.send(event);
    }

    fn transition(&mut self, event: ConnectionEvent) {
        if let Some(next) = event.state() {
            log::debug!("Device link {:?} -> {:?}", self.state, next);
            self.state = next;
            self.watch.set(next);
        }
        self.emit(event);
    }

    /// Open the device matching `selector` and perform the handshake.
    pub fn connect(&mut self, selector: &DeviceSelector) -> Result<DeviceHandle, ConnectError> {
        if self.transport.is_some() {
            self.disconnect();
        }
        self.selector = Some(selector.clone());
        self.transition(ConnectionEvent::Connecting);

        let opened = self.connector.open(selector).and_then(|mut transport| {
            match transport.handshake().and_then(check_info) {
                Ok(info) => Ok((transport, info)),
                Err(e) => {
                    transport.close();
                    Err(ConnectError::Handshake(e.to_string()))
                }
            }
        });

        match opened {
            Ok((transport, info)) => {
                self.sessions += 1;
                log::info!(
                    "Connected to {} '{}' on {} (firmware {}, {} channels at {} S/s)",
                    info.family,
                    info.name,
                    info.port,
                    info.firmware,
                    info.channel_count(),
                    info.sample_rate
                );
                let handle = DeviceHandle {
                    info,
                    session: self.sessions,
                };
                self.transport = Some(transport);
                self.handle = Some(handle.clone());
                self.transition(ConnectionEvent::Connected);
                Ok(handle)
            }
            Err(e) => {
                log::debug!("Connecting to {} failed: {}", selector, e);
                self.transition(ConnectionEvent::Disconnected);
                Err(e)
            }
        }
    }

    /// Connect, retrying with backoff. Emits a persistent-failure event when retries run out.
    pub fn connect_with_retry(
        &mut self,
        selector: &DeviceSelector,
        cancel: &AtomicBool,
    ) -> Result<DeviceHandle, ConnectError> {
        self.selector = Some(selector.clone());
        self.attempts = 0;
        self.retry(false, cancel)
    }

    /// Reconnect to the last selected device after a fault. Waits one backoff interval before
    /// every attempt.
    ///
    /// Attempts are counted until streaming starts again, so a device that connects but never
    /// streams still runs out of retries.
    pub fn reconnect(&mut self, cancel: &AtomicBool) -> Result<DeviceHandle, ConnectError> {
        self.retry(true, cancel)
    }

    fn retry(&mut self, wait_first: bool, cancel: &AtomicBool) -> Result<DeviceHandle, ConnectError> {
        let selector = self.selector.clone().ok_or(ConnectError::NoSelector)?;
        let attempts = self.policy.max_retries.saturating_add(1);

        while self.attempts < attempts {
            let attempt = self.attempts;
            let wait = if wait_first {
                Some(self.policy.backoff(attempt))
            } else if attempt > 0 {
                Some(self.policy.backoff(attempt - 1))
            } else {
                None
            };
            if let Some(wait) = wait {
                if !sleep_cancellable(wait, cancel) {
                    return Err(ConnectError::Cancelled);
                }
            }
            if cancel.load(Ordering::Acquire) {
                return Err(ConnectError::Cancelled);
            }

            self.attempts += 1;
            match self.connect(&selector) {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    log::warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        attempts,
                        selector,
                        e
                    );
                    self.last_failure = e.to_string();
                }
            }
        }

        self.emit(ConnectionEvent::PersistentFailure { attempts });
        Err(ConnectError::RetriesExhausted {
            attempts,
            last: self.last_failure.clone(),
        })
    }

    /// Start the sample stream. Calling it while already streaming is a no-op.
    pub fn start_streaming(&mut self, channels: &[ChannelConfig]) -> Result<(), LinkError> {
        match self.state {
            ConnectionState::Streaming => return Ok(()),
            ConnectionState::Connected => {}
            other => return Err(LinkError::NotStreaming(other)),
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or(LinkError::NotStreaming(self.state))?;
        transport.start_streaming(channels)?;
        self.attempts = 0;
        self.transition(ConnectionEvent::Streaming);
        Ok(())
    }

    /// Stop the sample stream. Calling it while not streaming is a no-op.
    pub fn stop_streaming(&mut self) -> Result<(), LinkError> {
        if self.state != ConnectionState::Streaming {
            return Ok(());
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.stop_streaming()?;
        }
        self.transition(ConnectionEvent::Connected);
        Ok(())
    }

    pub fn read_next_block(&mut self, timeout: Duration) -> Result<RawSampleBlock, LinkError> {
        if self.state != ConnectionState::Streaming {
            return Err(LinkError::NotStreaming(self.state));
        }
        match self.transport.as_mut() {
            Some(transport) => transport.read_block(timeout),
            None => Err(LinkError::NotStreaming(self.state)),
        }
    }

    /// Enter `Faulted`, tear the transport down and settle in `Disconnected`.
    pub fn fault(&mut self, reason: &LinkError) {
        log::warn!("Device link fault: {}", reason);
        self.last_failure = reason.to_string();
        self.transition(ConnectionEvent::Faulted(reason.to_string()));
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.stop_streaming();
            transport.close();
        }
        self.handle = None;
        self.transition(ConnectionEvent::Disconnected);
    }

    /// Close the device. Calling it while disconnected is a no-op.
    pub fn disconnect(&mut self) {
        if self.transport.is_none() && self.state == ConnectionState::Disconnected {
            return;
        }
        if let Some(mut transport) = self.transport.take() {
            if self.state == ConnectionState::Streaming {
                if let Err(e) = transport.stop_streaming() {
                    log::debug!("Stopping stream during disconnect failed: {}", e);
                }
            }
            transport.close();
        }
        self.handle = None;
        self.transition(ConnectionEvent::Disconnected);
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}
