//! Serial port handling
//!
//! Opens and configures the port the ESP32 bridge sits on, and finds it by
//! the USB-UART chip the board carries.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use super::{DispatchError, DEFAULT_BAUD_RATE};

/// USB-UART chips found on ESP32 boards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeChip {
    /// Silicon Labs CP2102/CP2104
    Cp210x,
    /// WCH CH340/CH341
    Ch340,
    /// WCH CH9102
    Ch9102,
    /// FTDI FT232R
    Ft232,
    /// USB serial/JTAG built into ESP32-S3/C3
    Esp32Native,
}

impl BridgeChip {
    /// Identify a chip from its USB vendor and product id
    pub fn from_usb(vid: u16, pid: u16) -> Option<Self> {
        match (vid, pid) {
            (0x10C4, 0xEA60) => Some(BridgeChip::Cp210x),
            (0x1A86, 0x7523) | (0x1A86, 0x5523) => Some(BridgeChip::Ch340),
            (0x1A86, 0x55D4) => Some(BridgeChip::Ch9102),
            (0x0403, 0x6001) => Some(BridgeChip::Ft232),
            (0x303A, 0x1001) => Some(BridgeChip::Esp32Native),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeChip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeChip::Cp210x => "CP210x",
            BridgeChip::Ch340 => "CH340",
            BridgeChip::Ch9102 => "CH9102",
            BridgeChip::Ft232 => "FT232",
            BridgeChip::Esp32Native => "ESP32 USB-JTAG",
        };
        f.write_str(name)
    }
}

/// A serial port that may have the bridge behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgePort {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM13")
    pub name: String,
    /// USB vendor and product id, for USB ports
    pub usb_id: Option<(u16, u16)>,
    /// Recognized USB-UART chip
    pub chip: Option<BridgeChip>,
    /// USB serial number, when the device reports one
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for BridgePort {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                usb_id: Some((usb.vid, usb.pid)),
                chip: BridgeChip::from_usb(usb.vid, usb.pid),
                serial_number: usb.serial_number,
            },
            _ => Self {
                name: info.port_name,
                usb_id: None,
                chip: None,
                serial_number: None,
            },
        }
    }
}

/// Order candidates: recognized chips first, then other USB ports, then the rest
fn rank(ports: &mut Vec<BridgePort>) {
    ports.sort_by(|a, b| {
        let key = |p: &BridgePort| (p.chip.is_none(), p.usb_id.is_none());
        key(a).cmp(&key(b)).then_with(|| a.name.cmp(&b.name))
    });
    ports.dedup_by(|a, b| a.name == b.name);
}

/// Enumerate serial ports, most likely bridge first
pub fn find_bridges() -> Vec<BridgePort> {
    let mut ports: Vec<BridgePort> = match serialport::available_ports() {
        Ok(found) => found.into_iter().map(BridgePort::from).collect(),
        Err(e) => {
            warn!("serial port enumeration failed: {}", e);
            Vec::new()
        }
    };
    rank(&mut ports);
    ports
}

/// Pick the bridge port when exactly one recognized chip is attached
pub fn detect_bridge() -> Result<BridgePort, DispatchError> {
    select_bridge(find_bridges())
}

fn select_bridge(ports: Vec<BridgePort>) -> Result<BridgePort, DispatchError> {
    let mut known = ports.into_iter().filter(|p| p.chip.is_some());
    match (known.next(), known.next()) {
        (Some(port), None) => {
            debug!(port = %port.name, "detected bridge");
            Ok(port)
        }
        (None, _) => Err(DispatchError::SerialError(
            "no ESP32 bridge found; pass the port name explicitly".to_string(),
        )),
        (Some(first), Some(second)) => Err(DispatchError::SerialError(format!(
            "several bridges attached ({}, {}, ...); pass the port name explicitly",
            first.name, second.name
        ))),
    }
}

/// Open a serial port with the given read timeout
pub fn open_port(
    name: &str,
    baud_rate: Option<u32>,
    read_timeout: Duration,
) -> Result<Box<dyn SerialPort>, DispatchError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    debug!(port = name, baud, "opening serial port");

    serialport::new(name, baud)
        .timeout(read_timeout)
        .open()
        .map_err(|e| DispatchError::SerialError(e.to_string()))
}

/// Configure a serial port as 8N1 without flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), DispatchError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| DispatchError::SerialError(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| DispatchError::SerialError(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| DispatchError::SerialError(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| DispatchError::SerialError(e.to_string()))?;

    // Asserting DTR/RTS resets most ESP32 dev boards; the settle delay after
    // open covers the reboot.
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("failed to set DTR high: {} (continuing)", e);
    }
    if let Err(e) = port.write_request_to_send(true) {
        warn!("failed to set RTS high: {} (continuing)", e);
    }

    Ok(())
}

/// Discard any unread input
pub fn clear_input(port: &mut dyn SerialPort) -> Result<(), DispatchError> {
    port.clear(serialport::ClearBuffer::Input)
        .map_err(|e| DispatchError::SerialError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> BridgePort {
        BridgePort {
            name: name.to_string(),
            usb_id: Some((vid, pid)),
            chip: BridgeChip::from_usb(vid, pid),
            serial_number: None,
        }
    }

    fn native(name: &str) -> BridgePort {
        BridgePort {
            name: name.to_string(),
            usb_id: None,
            chip: None,
            serial_number: None,
        }
    }

    #[test]
    fn test_chip_from_usb_id() {
        assert_eq!(BridgeChip::from_usb(0x10C4, 0xEA60), Some(BridgeChip::Cp210x));
        assert_eq!(BridgeChip::from_usb(0x1A86, 0x7523), Some(BridgeChip::Ch340));
        assert_eq!(BridgeChip::from_usb(0x303A, 0x1001), Some(BridgeChip::Esp32Native));
        // Arduino Uno
        assert_eq!(BridgeChip::from_usb(0x2341, 0x0043), None);
        assert_eq!(BridgeChip::Ch9102.to_string(), "CH9102");
    }

    #[test]
    fn test_known_chips_ranked_first() {
        let mut ports = vec![
            native("/dev/ttyS0"),
            usb("/dev/ttyACM0", 0x2341, 0x0043),
            usb("/dev/ttyUSB1", 0x1A86, 0x7523),
            usb("/dev/ttyUSB0", 0x10C4, 0xEA60),
            usb("/dev/ttyUSB0", 0x10C4, 0xEA60),
        ];
        rank(&mut ports);

        let ordered: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            ordered,
            vec!["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyACM0", "/dev/ttyS0"]
        );
    }

    #[test]
    fn test_select_single_bridge() {
        let port = select_bridge(vec![
            usb("COM3", 0x2341, 0x0043),
            usb("COM13", 0x10C4, 0xEA60),
        ])
        .unwrap();
        assert_eq!(port.name, "COM13");
        assert_eq!(port.chip, Some(BridgeChip::Cp210x));
    }

    #[test]
    fn test_select_rejects_none_or_several() {
        let err = select_bridge(vec![native("/dev/ttyS0")]).unwrap_err();
        assert!(err.to_string().contains("no ESP32 bridge"));

        let err = select_bridge(vec![
            usb("/dev/ttyUSB0", 0x10C4, 0xEA60),
            usb("/dev/ttyUSB1", 0x1A86, 0x55D4),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("/dev/ttyUSB1"));
    }

    #[test]
    fn test_open_missing_port_is_serial_error() {
        let err = open_port("/dev/burstlink-does-not-exist", None, Duration::from_millis(10))
            .err()
            .expect("opening a missing port should fail");
        assert!(matches!(err, DispatchError::SerialError(_)));
    }
}
