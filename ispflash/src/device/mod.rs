//! Host-side discovery of programmers and USB bootloaders.
//!
//! Serial ports are classified by the USB-UART bridge behind them; USB
//! bootloaders (WCH, STC8H8K*U) are listed straight from the bus because they
//! have no serial node.

use crate::error::{Error, Result};

use log::{debug, info, trace};

/// Transport type for discovered endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum TransportKind {
    /// Serial transport (UART bridge or USB CDC).
    Serial,
    /// Native USB bootloader.
    Usb,
}

/// Known USB-UART bridges and USB bootloaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum DeviceKind {
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// WCH chip waiting in its USB bootloader.
    WchIsp,
    /// STC8H8K*U waiting in its USB-HID bootloader.
    StcIsp,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs; an empty PID list accepts any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x4348, &[0x55E0], DeviceKind::WchIsp),
    (0x1A86, &[0x55E0], DeviceKind::WchIsp),
    (0x34BF, &[0x1001], DeviceKind::StcIsp),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::WchIsp => "WCH ISP",
            Self::StcIsp => "STC ISP",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether the device is a bootloader rather than a bridge.
    pub fn is_bootloader(&self) -> bool {
        matches!(self, Self::WchIsp | Self::StcIsp)
    }

    /// Bridges preferred during auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Ch340 | Self::Cp210x)
    }
}

/// Discovered device endpoint information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Serial node ("/dev/ttyUSB0", "COM3") or "usb:<bus>:<address>".
    pub name: String,
    /// Transport type.
    pub transport: TransportKind,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Whether the endpoint looks like a programmer or bootloader.
    pub fn is_likely_programmer(&self) -> bool {
        self.device
            .is_known()
    }
}

#[cfg(feature = "native")]
fn detect_serial_ports(result: &mut Vec<DetectedPort>) {
    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort {
                    name: port_info
                        .port_name
                        .clone(),
                    transport: TransportKind::Serial,
                    device: DeviceKind::Unknown,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, detected.device
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }
}

#[cfg(not(feature = "native"))]
fn detect_serial_ports(_: &mut Vec<DetectedPort>) {}

#[cfg(feature = "usb")]
fn detect_usb_bootloaders(result: &mut Vec<DetectedPort>) {
    use crate::target::ProtocolFamily;

    let configs = [
        ProtocolFamily::Wch.usb_config(),
        ProtocolFamily::StcUsb.usb_config(),
    ];
    match crate::port::usb::list_bootloaders(&configs) {
        Ok(found) => {
            for dev in found {
                trace!(
                    "Found USB bootloader at {}:{} ({:04X}:{:04X})",
                    dev.bus, dev.address, dev.vid, dev.pid
                );
                result.push(DetectedPort {
                    name: format!("usb:{}:{}", dev.bus, dev.address),
                    transport: TransportKind::Usb,
                    device: DeviceKind::from_vid_pid(dev.vid, dev.pid),
                    vid: Some(dev.vid),
                    pid: Some(dev.pid),
                    manufacturer: None,
                    product: None,
                    serial: None,
                });
            }
        },
        Err(e) => {
            debug!("Failed to enumerate USB devices: {e}");
        },
    }
}

#[cfg(not(feature = "usb"))]
fn detect_usb_bootloaders(_: &mut Vec<DetectedPort>) {}

/// Detect all serial ports and USB bootloaders with metadata.
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();
    detect_serial_ports(&mut result);
    detect_usb_bootloaders(&mut result);
    result
}

/// Detect endpoints that look like programmers or bootloaders.
pub fn detect_programmer_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_likely_programmer)
        .collect()
}

/// Pick the serial port a UART bootloader is most likely behind.
pub fn select_serial_port(ports: &[DetectedPort]) -> Result<DetectedPort> {
    let serial: Vec<&DetectedPort> = ports
        .iter()
        .filter(|p| p.transport == TransportKind::Serial)
        .collect();

    if let Some(port) = serial
        .iter()
        .find(|p| {
            p.device
                .is_high_priority()
        })
        .or_else(|| {
            serial
                .iter()
                .find(|p| {
                    p.device
                        .is_known()
                })
        })
    {
        info!(
            "Auto-detected {} USB-UART bridge: {}",
            port.device
                .name(),
            port.name
        );
        return Ok((*port).clone());
    }

    if let Some(port) = serial.first() {
        info!("Using first available port: {}", port.name);
        return Ok((*port).clone());
    }

    Err(Error::DeviceNotFound)
}

/// Auto-detect the serial port of a UART bootloader.
pub fn auto_detect_port() -> Result<DetectedPort> {
    select_serial_port(&detect_ports())
}

/// Find an endpoint by name pattern.
pub fn find_port_by_pattern(pattern: &str) -> Result<DetectedPort> {
    detect_ports()
        .into_iter()
        .find(|p| {
            p.name
                .contains(pattern)
        })
        .ok_or(Error::DeviceNotFound)
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port
            .device
            .is_known()
        {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}
