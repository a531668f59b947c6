//! Discovery and opening of USB scopes.
//!
//! Ports are matched by USB vendor/product id against [`DeviceFamily`]; the family decides the
//! capabilities the transport assumes until the handshake reports the real values.

use crate::device::{DeviceFamily, DeviceSelector};
use crate::device_link::{ConnectError, Connector, Transport};
use crate::serial_terminal::{SerialTerminal, SerialTerminalError, SerialTransport};
use serialport::{SerialPortInfo, SerialPortType};
use std::io;

const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedDevice {
    pub name: String,
    pub port: String,
    pub family: DeviceFamily,
}

impl DetectedDevice {
    /// `None` for ports that are not a supported scope.
    pub fn from_port_info(info: &SerialPortInfo) -> Option<Self> {
        let SerialPortType::UsbPort(usb) = &info.port_type else {
            return None;
        };
        let family = DeviceFamily::from_usb_ids(usb.vid, usb.pid)?;
        Some(Self {
            name: usb
                .product
                .clone()
                .unwrap_or_else(|| family.as_str().to_string()),
            port: info.port_name.clone(),
            family,
        })
    }

    fn matches(&self, selector: &DeviceSelector) -> bool {
        selector.port.as_deref().is_none_or(|p| p == self.port)
            && selector.name.as_deref().is_none_or(|n| n == self.name)
    }
}

impl From<SerialTerminalError> for ConnectError {
    fn from(error: SerialTerminalError) -> Self {
        match error {
            SerialTerminalError::SerialPort(e) => ConnectError::Serial(e),
            SerialTerminalError::Io(e) => ConnectError::Io(e),
            other => ConnectError::Handshake(other.to_string()),
        }
    }
}

/// Pick the device for `selector` from `devices`.
pub fn select<'a>(
    devices: &'a [DetectedDevice],
    selector: &DeviceSelector,
) -> Result<&'a DetectedDevice, ConnectError> {
    if let Some(device) = devices.iter().find(|d| d.matches(selector)) {
        return Ok(device);
    }
    match &selector.port {
        // The port exists but is something else.
        Some(port) if !devices.iter().any(|d| &d.port == port) && selector.name.is_none() => {
            Err(ConnectError::InvalidPort { port: port.clone() })
        }
        _ => Err(ConnectError::DeviceNotFound {
            selector: selector.to_string(),
        }),
    }
}

/// [`Connector`] for scopes attached as USB serial devices.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    baud_rate: u32,
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }

    /// All attached supported scopes.
    pub fn available_devices() -> Result<Vec<DetectedDevice>, ConnectError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .iter()
            .filter_map(DetectedDevice::from_port_info)
            .collect())
    }

    fn open_terminal(&self, device: &DetectedDevice) -> Result<SerialTerminal, ConnectError> {
        let mut terminal =
            SerialTerminal::open(&device.port, self.baud_rate).map_err(|e| match e {
                SerialTerminalError::SerialPort(serial)
                    if serial.kind() == serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) =>
                {
                    ConnectError::PermissionDenied {
                        port: device.port.clone(),
                    }
                }
                SerialTerminalError::SerialPort(serial)
                    if serial.kind() == serialport::ErrorKind::NoDevice =>
                {
                    ConnectError::DeviceNotFound {
                        selector: device.port.clone(),
                    }
                }
                other => other.into(),
            })?;

        match terminal.initialize() {
            Ok(()) => Ok(terminal),
            Err(e @ SerialTerminalError::Timeout { .. }) => {
                log::debug!("Timeout during initialization, sending reset");
                let _ = terminal.send_reset();
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Connector for SerialConnector {
    fn open(&mut self, selector: &DeviceSelector) -> Result<Box<dyn Transport>, ConnectError> {
        let devices = Self::available_devices()?;
        log::debug!("Found {} supported device(s)", devices.len());
        let device = select(&devices, selector)?;
        log::debug!(
            "Connecting to {} '{}' on {}",
            device.family,
            device.name,
            device.port
        );
        let terminal = self.open_terminal(device)?;
        Ok(Box::new(SerialTransport::new(
            terminal,
            device.family,
            &device.name,
            &device.port,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb_port(port: &str, vid: u16, pid: u16, product: Option<&str>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: port.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: product.map(str::to_string),
            }),
        }
    }

    fn devices() -> Vec<DetectedDevice> {
        [
            usb_port("/dev/ttyACM0", 0x2e8a, 0x000a, Some("bench")),
            usb_port("/dev/ttyACM1", 0x0403, 0x6001, Some("FTDI")),
            usb_port("/dev/ttyACM2", 0x0483, 0x5740, None),
        ]
        .iter()
        .filter_map(DetectedDevice::from_port_info)
        .collect()
    }

    #[test]
    fn test_only_supported_ids_detected() {
        let devices = devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "bench");
        assert_eq!(devices[1].family, DeviceFamily::WhoaScopePro);
        assert_eq!(devices[1].name, "WhoaScope Pro");
    }

    #[test]
    fn test_select() {
        let devices = devices();
        assert_eq!(
            select(&devices, &DeviceSelector::any()).unwrap().port,
            "/dev/ttyACM0"
        );
        assert_eq!(
            select(&devices, &DeviceSelector::by_name("WhoaScope Pro"))
                .unwrap()
                .port,
            "/dev/ttyACM2"
        );
        assert!(matches!(
            select(&devices, &DeviceSelector::by_port("/dev/ttyACM1")),
            Err(ConnectError::InvalidPort { .. })
        ));
        assert!(matches!(
            select(&devices, &DeviceSelector::by_name("lab")),
            Err(ConnectError::DeviceNotFound { .. })
        ));
        assert!(matches!(
            select(&[], &DeviceSelector::any()),
            Err(ConnectError::DeviceNotFound { .. })
        ));
    }
}
