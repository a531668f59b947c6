//! USB-CDC transport.
//!
//! The device speaks a line-based command protocol terminated by a `> ` prompt. Once streaming
//! it switches to binary block frames until interrupted with CTRL-C:
//!
//! ```text
//! 0xA5 0x5A | payload length: u32 LE | sequence: u64 LE | payload
//! ```

use crate::calibration::{Calibration, LinearCalibration};
use crate::config::ChannelConfig;
use crate::device::{DeviceFamily, DeviceInfo, RawSampleBlock};
use crate::device_link::{LinkError, Transport};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROMPT: &str = "> ";
const CTRL_C: u8 = 0x03;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);
const PORT_POLL: Duration = Duration::from_millis(10);

const FRAME_MAGIC: [u8; 2] = [0xA5, 0x5A];
const FRAME_HEADER_LEN: usize = 2 + 4 + 8;
/// Larger lengths are treated as corruption.
pub const MAX_PAYLOAD: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum SerialTerminalError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(
        "Timeout error: Expected prompt '{expected}' but got '{actual}'. Likely due to a timeout."
    )]
    Timeout { expected: String, actual: String },

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Unexpected response to '{command}': '{response}'")]
    InvalidResponse { command: String, response: String },
}

impl From<SerialTerminalError> for LinkError {
    fn from(error: SerialTerminalError) -> Self {
        match error {
            SerialTerminalError::Io(e) if is_unplug(&e) => LinkError::Unplugged,
            SerialTerminalError::Io(e) => LinkError::Io(e),
            other => LinkError::Protocol(other.to_string()),
        }
    }
}

fn is_unplug(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::PermissionDenied
    )
}

/// Command channel to the device firmware.
pub struct SerialTerminal {
    serial: Box<dyn SerialPort>,
    prompt: String,
}

impl SerialTerminal {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, SerialTerminalError> {
        let serial = serialport::new(port, baud_rate)
            .timeout(PORT_POLL)
            .open()?;
        let mut terminal = Self {
            serial,
            prompt: PROMPT.to_string(),
        };
        terminal.flush()?;
        Ok(terminal)
    }

    /// Interrupt whatever the firmware was doing and enable the prompt.
    pub fn initialize(&mut self) -> Result<(), SerialTerminalError> {
        log::debug!("Sending CTRL-C to reset the command line");
        self.send_ctrl_c()?;
        log::debug!("Turning on prompt");
        self.exec("prompt on", Some(COMMAND_TIMEOUT))?;
        self.flush()
    }

    pub fn flush(&mut self) -> Result<(), SerialTerminalError> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    pub fn send_ctrl_c(&mut self) -> Result<(), SerialTerminalError> {
        self.serial.write_all(&[CTRL_C])?;
        Ok(())
    }

    pub fn send_reset(&mut self) -> Result<(), SerialTerminalError> {
        self.serial.write_all(b"reset\n")?;
        Ok(())
    }

    fn send(&mut self, command: &str) -> Result<(), SerialTerminalError> {
        self.serial.write_all(format!("{command}\n").as_bytes())?;
        Ok(())
    }

    /// Run `command` and return its output up to the next prompt, trimmed.
    pub fn exec(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, SerialTerminalError> {
        self.send(command)?;
        let response = self.read_until_prompt(timeout)?;
        Ok(String::from_utf8(response)?.trim().to_string())
    }

    /// Read until the prompt appears, returning what came before it.
    fn read_until_prompt(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, SerialTerminalError> {
        let prompt = self.prompt.as_bytes().to_vec();
        let mut response = Vec::new();
        let start = Instant::now();
        let mut byte = [0u8; 1];

        loop {
            match self.serial.read(&mut byte) {
                Ok(1) => {
                    response.push(byte[0]);
                    if response.ends_with(&prompt) {
                        response.truncate(response.len() - prompt.len());
                        return Ok(response);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            if timeout.is_some_and(|t| start.elapsed() >= t) {
                let tail = response.len().saturating_sub(2);
                return Err(SerialTerminalError::Timeout {
                    expected: self.prompt.clone(),
                    actual: String::from_utf8_lossy(&response[tail..]).to_string(),
                });
            }
        }
    }

    fn query<T: std::str::FromStr>(&mut self, command: &str) -> Result<T, SerialTerminalError> {
        let response = self.exec(command, Some(COMMAND_TIMEOUT))?;
        response
            .parse()
            .map_err(|_| SerialTerminalError::InvalidResponse {
                command: command.to_string(),
                response,
            })
    }

    fn read_raw(&mut self, buffer: &mut [u8]) -> Result<usize, SerialTerminalError> {
        match self.serial.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Parse a `cal <channel>` response: `zero reference_counts reference_volts volts_per_division`.
pub fn parse_calibration(response: &str) -> Option<LinearCalibration> {
    let fields: Vec<f64> = response
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    match fields[..] {
        [zero, reference_counts, reference_volts, vdiv]
            if reference_counts != 0.0 && vdiv > 0.0 =>
        {
            Some(LinearCalibration::new(
                zero,
                reference_counts,
                reference_volts,
                vdiv,
            ))
        }
        _ => None,
    }
}

fn valid_sample_rate(rate: f64) -> bool {
    rate.is_finite() && rate >= 1.0
}

/// Reassembles block frames from the raw byte stream.
#[derive(Debug, Default)]
pub struct BlockFramer {
    buffer: Vec<u8>,
    /// Bytes skipped while hunting for a frame start.
    discarded: u64,
}

impl BlockFramer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Next complete frame as `(sequence, payload)`.
    pub fn next_frame(&mut self) -> Option<(u64, Vec<u8>)> {
        loop {
            let start = self
                .buffer
                .windows(FRAME_MAGIC.len())
                .position(|w| w == FRAME_MAGIC);
            let Some(start) = start else {
                // Keep a trailing half magic.
                let keep = usize::from(self.buffer.last() == Some(&FRAME_MAGIC[0]));
                let skip = self.buffer.len() - keep;
                self.discard(skip);
                return None;
            };
            self.discard(start);
            if self.buffer.len() < FRAME_HEADER_LEN {
                return None;
            }

            let mut len = [0u8; 4];
            len.copy_from_slice(&self.buffer[2..6]);
            let len = u32::from_le_bytes(len) as usize;
            if len > MAX_PAYLOAD {
                log::debug!("Implausible block length {}, resyncing", len);
                self.discard(1);
                continue;
            }
            if self.buffer.len() < FRAME_HEADER_LEN + len {
                return None;
            }

            let mut sequence = [0u8; 8];
            sequence.copy_from_slice(&self.buffer[6..FRAME_HEADER_LEN]);
            let payload = self.buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
            self.buffer.drain(..FRAME_HEADER_LEN + len);
            return Some((u64::from_le_bytes(sequence), payload));
        }
    }

    fn discard(&mut self, count: usize) {
        if count > 0 {
            self.discarded += count as u64;
            self.buffer.drain(..count);
        }
    }

    /// Encode one frame, as the firmware does.
    pub fn encode(sequence: u64, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&sequence.to_le_bytes());
        frame.extend_from_slice(payload);
        frame
    }
}

/// [`Transport`] over a [`SerialTerminal`].
pub struct SerialTransport {
    terminal: SerialTerminal,
    framer: BlockFramer,
    family: DeviceFamily,
    name: String,
    port: String,
    channel_count: usize,
    sample_rate: f64,
    read_buffer: Vec<u8>,
}

impl SerialTransport {
    pub fn new(terminal: SerialTerminal, family: DeviceFamily, name: &str, port: &str) -> Self {
        Self {
            terminal,
            framer: BlockFramer::default(),
            family,
            name: name.to_string(),
            port: port.to_string(),
            channel_count: family.capabilities().channel_count,
            sample_rate: family.capabilities().max_sample_rate,
            read_buffer: vec![0u8; 4096],
        }
    }

    fn read_calibration(&mut self, channel: usize) -> Arc<dyn Calibration> {
        let response = self.terminal.exec(&format!("cal {channel}"), Some(COMMAND_TIMEOUT));
        match response.as_deref().map(parse_calibration) {
            Ok(Some(calibration)) => {
                log::debug!("Channel {} calibration: {:?}", channel, calibration);
                Arc::new(calibration)
            }
            Ok(None) | Err(_) => {
                log::info!(
                    "No stored calibration for channel {}, using nominal values",
                    channel
                );
                Arc::new(self.family.nominal_calibration())
            }
        }
    }
}

impl Transport for SerialTransport {
    fn handshake(&mut self) -> Result<DeviceInfo, LinkError> {
        let firmware = self.terminal.exec("ver", Some(COMMAND_TIMEOUT))?;
        let hostname = self.terminal.exec("hostname", Some(COMMAND_TIMEOUT))?;
        if !hostname.is_empty() {
            self.name = hostname;
        }
        self.channel_count = self.terminal.query("channels")?;
        let sample_rate: f64 = self.terminal.query("rate")?;
        if !valid_sample_rate(sample_rate) {
            return Err(LinkError::Protocol(format!(
                "{} reports sample rate {}",
                self.family, sample_rate
            )));
        }
        self.sample_rate = sample_rate;

        let mut capabilities = self.family.capabilities();
        if self.channel_count == 0 || self.channel_count > capabilities.channel_count {
            return Err(LinkError::Protocol(format!(
                "{} reports {} channels",
                self.family, self.channel_count
            )));
        }
        capabilities.channel_count = self.channel_count;

        let calibrations = (0..self.channel_count)
            .map(|channel| self.read_calibration(channel))
            .collect();
        Ok(DeviceInfo {
            family: self.family,
            name: self.name.clone(),
            port: self.port.clone(),
            firmware,
            capabilities,
            sample_rate: self.sample_rate,
            calibrations,
        })
    }

    fn start_streaming(&mut self, channels: &[ChannelConfig]) -> Result<(), LinkError> {
        for (channel, config) in channels.iter().enumerate().take(self.channel_count) {
            self.terminal.exec(
                &format!(
                    "gain {} {} {}",
                    channel,
                    config.volts_per_division,
                    config.coupling.as_str()
                ),
                Some(COMMAND_TIMEOUT),
            )?;
        }
        self.framer.clear();
        self.terminal.send("stream on")?;
        log::debug!("Streaming started on {}", self.port);
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), LinkError> {
        self.terminal.send_ctrl_c()?;
        // Discard the frames still in flight up to the prompt.
        self.terminal.read_until_prompt(Some(COMMAND_TIMEOUT))?;
        self.terminal.flush()?;
        self.framer.clear();
        log::debug!("Streaming stopped on {}", self.port);
        Ok(())
    }

    fn read_block(&mut self, timeout: Duration) -> Result<RawSampleBlock, LinkError> {
        let start = Instant::now();
        loop {
            if let Some((sequence, payload)) = self.framer.next_frame() {
                return Ok(RawSampleBlock {
                    sequence,
                    sample_rate: self.sample_rate,
                    channel_count: self.channel_count,
                    payload,
                    received_at: Instant::now(),
                });
            }
            if start.elapsed() >= timeout {
                return Err(LinkError::Timeout(timeout));
            }
            let n = self.terminal.read_raw(&mut self.read_buffer)?;
            self.framer.extend(&self.read_buffer[..n]);
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.terminal.send_ctrl_c() {
            log::debug!("Closing {}: {}", self.port, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_splits_frames() {
        let mut framer = BlockFramer::default();
        let mut stream = BlockFramer::encode(7, &[1, 2, 3, 4]);
        stream.extend(BlockFramer::encode(9, &[5, 6]));
        // Delivered in awkward chunks.
        for chunk in stream.chunks(5) {
            framer.extend(chunk);
        }
        assert_eq!(framer.next_frame(), Some((7, vec![1, 2, 3, 4])));
        assert_eq!(framer.next_frame(), Some((9, vec![5, 6])));
        assert_eq!(framer.next_frame(), None);
        assert_eq!(framer.discarded(), 0);
    }

    #[test]
    fn test_framer_waits_for_partial_frame() {
        let mut framer = BlockFramer::default();
        let frame = BlockFramer::encode(1, &[0xAA; 10]);
        framer.extend(&frame[..12]);
        assert_eq!(framer.next_frame(), None);
        framer.extend(&frame[12..]);
        assert_eq!(framer.next_frame(), Some((1, vec![0xAA; 10])));
    }

    #[test]
    fn test_framer_resyncs_after_garbage() {
        let mut framer = BlockFramer::default();
        framer.extend(b"prompt noise\r\n");
        framer.extend(&[0xA5]);
        assert_eq!(framer.next_frame(), None);
        // Magic followed by an impossible length.
        framer.extend(&[0x5A, 0xff, 0xff, 0xff, 0xff]);
        framer.extend(&BlockFramer::encode(3, &[1, 0]));
        assert_eq!(framer.next_frame(), Some((3, vec![1, 0])));
        assert!(framer.discarded() > 14);
    }

    #[test]
    fn test_parse_calibration() {
        let cal = parse_calibration("12.5 2030 5.0 1").unwrap();
        assert_eq!(cal.zero_counts, 12.5);
        assert_eq!(cal.reference_counts, 2030.0);
        assert!(parse_calibration("").is_none());
        assert!(parse_calibration("1 2 3").is_none());
        assert!(parse_calibration("1 0 5 1").is_none());
        assert!(parse_calibration("a b c d").is_none());
    }

    #[test]
    fn test_sample_rate_must_be_usable() {
        assert!(valid_sample_rate(500_000.0));
        assert!(!valid_sample_rate(f64::NAN));
        assert!(!valid_sample_rate(f64::INFINITY));
        assert!(!valid_sample_rate(0.0));
        assert!(!valid_sample_rate(-1000.0));
        assert!(!valid_sample_rate(1e-300));
    }

    #[test]
    fn test_terminal_errors_map_to_link_errors() {
        let unplugged: LinkError =
            SerialTerminalError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).into();
        assert!(matches!(unplugged, LinkError::Unplugged));
        let timeout: LinkError = SerialTerminalError::Timeout {
            expected: PROMPT.to_string(),
            actual: String::new(),
        }
        .into();
        assert!(matches!(timeout, LinkError::Protocol(_)));
    }
}
