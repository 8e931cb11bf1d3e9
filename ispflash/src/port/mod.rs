//! Port abstraction for bootloader transports.
//!
//! Every ISP protocol in this crate talks to its bootloader through the
//! [`Port`] trait, a blocking byte channel with a per-read timeout:
//!
//! - **Serial** (feature `native`): PUYA, STM32 and STC-UART bootloaders via
//!   the `serialport` crate
//! - **USB** (feature `usb`): WCH bulk endpoints and STC HID reports via `rusb`
//!
//! ## Architecture
//!
//! ```text
//! +------------------------+
//! |  Flashers (wch, stc,   |
//! |  stm32) + frame codecs |
//! +-----------+------------+
//!             |
//!             v
//! +-----------+------------+
//! |       Port trait       |
//! +-----+-------------+----+
//!       |             |
//!       v             v
//! +-----+------+ +----+-------+
//! | NativePort | |  UsbPort   |
//! | serialport | |   rusb     |
//! +------------+ +------------+
//! ```
//!
//! A single `read` on a USB port returns at most one packet, so packet-framed
//! protocols (WCH) use [`Port::read_packet`] while stream protocols use
//! [`Port::read_exact_bytes`].

#[cfg(feature = "native")]
pub mod native;

#[cfg(feature = "usb")]
pub mod usb;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (even unless the bootloader says otherwise).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1000),
            data_bits: DataBits::Eight,
            parity: Parity::Even,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the parity mode.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the number of stop bits.
    #[must_use]
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    #[default]
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Optional USB VID/PID filter; a missing field matches any value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsbFilter {
    /// Vendor ID to match.
    pub vid: Option<u16>,
    /// Product ID to match.
    pub pid: Option<u16>,
}

impl UsbFilter {
    /// Filter matching exactly one VID/PID pair.
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid: Some(vid),
            pid: Some(pid),
        }
    }

    /// Whether no field is set.
    pub fn is_any(&self) -> bool {
        self.vid
            .is_none()
            && self
                .pid
                .is_none()
    }

    /// Check a device against the filter.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid
            .is_none_or(|v| v == vid)
            && self
                .pid
                .is_none_or(|p| p == pid)
    }

    /// Check optional USB ids; non-USB ports only match an empty filter.
    pub fn matches_optional(&self, vid: Option<u16>, pid: Option<u16>) -> bool {
        match (vid, pid) {
            (Some(vid), Some(pid)) => self.matches(vid, pid),
            _ => self.is_any(),
        }
    }
}

/// Unified port trait for bootloader communication.
///
/// Reads block for at most [`Port::timeout`]; an expired read surfaces as
/// `io::ErrorKind::TimedOut` from `Read::read` and as [`Error::Timeout`]
/// from the helper methods.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate. USB ports accept and ignore this.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Number of bytes already received and waiting to be read.
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }

    /// Read a single byte, `None` when the timeout expired first.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Read exactly `len` bytes or fail with [`Error::Timeout`].
    fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if is_timeout(&e) => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        if filled < len {
            return Err(Error::Timeout(format!(
                "expected {len} bytes on {}, received {filled}",
                self.name()
            )));
        }
        Ok(buf)
    }

    /// Read one transfer (one USB packet) of at most `max_len` bytes.
    fn read_packet(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        match self.read(&mut buf) {
            Ok(0) => Err(Error::Timeout(format!("no reply on {}", self.name()))),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            },
            Err(e) if is_timeout(&e) => {
                Err(Error::Timeout(format!("no reply on {}", self.name())))
            },
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl<T: Port + ?Sized> Port for Box<T> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        (**self).set_baud_rate(baud_rate)
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        (**self).bytes_to_read()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Timeouts show up as `TimedOut` from serialport and `WouldBlock` on some
/// platforms.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Find ports accepted by the given filter.
    fn find_by_filter(filter: &UsbFilter) -> Result<Vec<PortInfo>> {
        let ports = Self::list_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| filter.matches_optional(p.vid, p.pid))
            .collect())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};

#[cfg(feature = "usb")]
pub use usb::{UsbConfig, UsbPort, UsbTransfer};
