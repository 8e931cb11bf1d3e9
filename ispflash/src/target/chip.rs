//! Protocol selection and the common flasher interface.
//!
//! A [`ProtocolFamily`] is what the user asks for; the concrete
//! [`ProtocolVariant`] is resolved during the handshake (WCH picks v1 or v2
//! from the length of the detection reply).

use {
    crate::{
        error::{Error, Result},
        image::FlashImage,
        option::OptionBytes,
        port::{Parity, Port, SerialConfig, StopBits, UsbFilter},
    },
    std::{fmt, time::Duration},
};

/// Bootloader family selected by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ProtocolFamily {
    /// WCH CH5xx/CH32 USB bootloader (v1 or v2).
    #[default]
    Wch,
    /// PUYA PY32F0xx UART bootloader.
    Puya,
    /// STM32 system memory UART bootloader.
    Stm32,
    /// STC8G/STC8H UART bootloader.
    Stc,
    /// STC8H8K*U USB-HID bootloader.
    StcUsb,
}

impl ProtocolFamily {
    /// Every family, in display order.
    pub const ALL: [Self; 5] = [Self::Wch, Self::Puya, Self::Stm32, Self::Stc, Self::StcUsb];

    /// Get the family from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name
            .to_lowercase()
            .as_str()
        {
            "wch" | "ch55x" | "ch32" => Some(Self::Wch),
            "puya" | "py32" => Some(Self::Puya),
            "stm32" | "st" => Some(Self::Stm32),
            "stc" | "stc8" => Some(Self::Stc),
            "stc-usb" | "stcusb" | "stc8usb" => Some(Self::StcUsb),
            _ => None,
        }
    }

    /// Whether the bootloader is reached over native USB.
    pub fn is_usb(self) -> bool {
        matches!(self, Self::Wch | Self::StcUsb)
    }

    /// Baud rate the serial bootloader is first contacted at.
    pub fn serial_baud(self) -> Option<u32> {
        match self {
            Self::Puya | Self::Stm32 => Some(115_200),
            Self::Stc => Some(crate::target::stc::CALIBRATION_BAUD),
            Self::Wch | Self::StcUsb => None,
        }
    }

    /// Per-read timeout used when none is configured.
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::Wch => Duration::from_secs(5),
            Self::Puya | Self::Stm32 | Self::StcUsb => Duration::from_secs(1),
            Self::Stc => Duration::from_millis(10),
        }
    }

    /// Create a flasher over an existing port.
    ///
    /// This is useful for testing or custom port implementations.
    pub fn create_flasher_with_port<P: Port + 'static>(
        &self,
        port: P,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Flasher>> {
        use crate::target::{stc::StcFlasher, stm32::UartFlasher, wch::WchFlasher};

        Ok(match self {
            Self::Wch => Box::new(WchFlasher::new(port).with_legacy_key(options.legacy_key)),
            Self::Puya => Box::new(UartFlasher::puya(port)),
            Self::Stm32 => Box::new(UartFlasher::stm32(port)),
            Self::Stc => Box::new(StcFlasher::uart(port)),
            Self::StcUsb => Box::new(StcFlasher::usb(port)),
        })
    }

    /// Open the transport this family needs and create a flasher on it.
    ///
    /// Serial families use `options.port`, or the first serial port accepted
    /// by `options.filter` when no port is named.
    pub fn create_flasher(&self, options: &ConnectOptions) -> Result<Box<dyn Flasher>> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.default_timeout());
        match self.serial_baud() {
            Some(baud) => self.open_serial(options, baud, timeout),
            None => self.open_usb(options, timeout),
        }
    }

    /// Line settings for the serial families.
    ///
    /// PUYA parts talk 8N2; STM32 and STC use 8E1.
    pub fn serial_config(&self, port_name: impl Into<String>, baud: u32) -> SerialConfig {
        let config = SerialConfig::new(port_name, baud);
        match self {
            Self::Puya => config
                .with_parity(Parity::None)
                .with_stop_bits(StopBits::Two),
            _ => config,
        }
    }

    #[cfg(feature = "native")]
    fn open_serial(
        &self,
        options: &ConnectOptions,
        baud: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Flasher>> {
        use crate::port::{NativePort, NativePortEnumerator, PortEnumerator};

        let name = match &options.port {
            Some(name) => name.clone(),
            None => NativePortEnumerator::find_by_filter(&options.filter)?
                .into_iter()
                .next()
                .map(|p| p.name)
                .ok_or(Error::DeviceNotFound)?,
        };
        // Only the UART families need a configurable transfer rate; STC
        // always calibrates at 2400 first.
        let baud = match self {
            Self::Stc => baud,
            _ => options
                .baud
                .unwrap_or(baud),
        };
        let config = self
            .serial_config(name, baud)
            .with_timeout(timeout);
        let port = NativePort::open(&config)?;
        match self {
            Self::Stc => {
                use crate::target::stc::StcFlasher;
                let transfer_baud = options
                    .baud
                    .unwrap_or(crate::target::stc::TRANSFER_BAUD);
                Ok(Box::new(
                    StcFlasher::uart(port).with_transfer_baud(transfer_baud),
                ))
            },
            _ => self.create_flasher_with_port(port, options),
        }
    }

    #[cfg(not(feature = "native"))]
    fn open_serial(&self, _: &ConnectOptions, _: u32, _: Duration) -> Result<Box<dyn Flasher>> {
        Err(Error::Unsupported(format!(
            "{self} needs serial port support (feature `native`)"
        )))
    }

    #[cfg(feature = "usb")]
    fn open_usb(&self, options: &ConnectOptions, timeout: Duration) -> Result<Box<dyn Flasher>> {
        use crate::port::UsbPort;

        let config = self
            .usb_config()
            .with_filter(options.filter)
            .with_timeout(timeout);
        let port = UsbPort::open(&config)?;
        self.create_flasher_with_port(port, options)
    }

    #[cfg(not(feature = "usb"))]
    fn open_usb(&self, _: &ConnectOptions, _: Duration) -> Result<Box<dyn Flasher>> {
        Err(Error::Unsupported(format!(
            "{self} needs USB support (feature `usb`)"
        )))
    }

    /// USB transport parameters of a USB family's bootloader.
    #[cfg(feature = "usb")]
    pub fn usb_config(&self) -> crate::port::UsbConfig {
        use crate::{port::UsbConfig, target::{stc, wch}};

        match self {
            Self::StcUsb => UsbConfig::hid(stc::USB_IDS),
            _ => UsbConfig::bulk(wch::USB_IDS, wch::EP_OUT, wch::EP_IN),
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wch => write!(f, "WCH"),
            Self::Puya => write!(f, "PUYA"),
            Self::Stm32 => write!(f, "STM32"),
            Self::Stc => write!(f, "STC"),
            Self::StcUsb => write!(f, "STC-USB"),
        }
    }
}

/// Concrete bootloader protocol, fixed once the handshake succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolVariant {
    /// CH55x bootloader v1: plaintext, 60-byte chunks.
    WchV1,
    /// WCH bootloader v2 with UID-derived XOR key.
    WchV2,
    /// Early CH32V203 bootloader folding the chip type into every frame.
    WchV2Legacy,
    /// PY32F0xx ROM loader.
    Puya,
    /// STM32 system memory loader.
    Stm32,
    /// STC8 over UART.
    StcUart,
    /// STC8 over USB HID.
    StcUsb,
}

impl ProtocolVariant {
    /// Largest payload per program frame.
    pub fn chunk_size(self) -> usize {
        match self {
            Self::WchV1 => crate::protocol::wch::CHUNK_V1,
            Self::WchV2 | Self::WchV2Legacy => crate::protocol::wch::CHUNK_V2,
            Self::Puya | Self::StcUart | Self::StcUsb => 128,
            Self::Stm32 => 256,
        }
    }

    /// Family the variant belongs to.
    pub fn family(self) -> ProtocolFamily {
        match self {
            Self::WchV1 | Self::WchV2 | Self::WchV2Legacy => ProtocolFamily::Wch,
            Self::Puya => ProtocolFamily::Puya,
            Self::Stm32 => ProtocolFamily::Stm32,
            Self::StcUart => ProtocolFamily::Stc,
            Self::StcUsb => ProtocolFamily::StcUsb,
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WchV1 => write!(f, "WCH v1"),
            Self::WchV2 => write!(f, "WCH v2"),
            Self::WchV2Legacy => write!(f, "WCH v2 (legacy key)"),
            Self::Puya => write!(f, "PUYA"),
            Self::Stm32 => write!(f, "STM32"),
            Self::StcUart => write!(f, "STC UART"),
            Self::StcUsb => write!(f, "STC USB"),
        }
    }
}

/// Transport and protocol options for [`ProtocolFamily::create_flasher`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Serial port name; `None` picks the first port accepted by `filter`.
    pub port: Option<String>,
    /// Transfer baud rate (serial families).
    pub baud: Option<u32>,
    /// USB VID/PID filter; empty fields match any device.
    pub filter: UsbFilter,
    /// Per-read timeout; `None` uses the family default.
    pub timeout: Option<Duration>,
    /// Use the early CH32V203 key exchange.
    pub legacy_key: bool,
}

impl ConnectOptions {
    /// Options with every field at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the serial port.
    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Set the transfer baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    /// Set the USB filter.
    #[must_use]
    pub fn with_filter(mut self, filter: UsbFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set the per-read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Select the legacy WCH key exchange.
    #[must_use]
    pub fn with_legacy_key(mut self, legacy: bool) -> Self {
        self.legacy_key = legacy;
        self
    }
}

/// What the handshake learned about the chip.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ChipInfo {
    /// Marketing name from the device table.
    pub name: String,
    /// Protocol-specific chip id.
    pub id: u32,
    /// Bootloader version string.
    pub bootloader: String,
    /// Resolved protocol variant.
    pub variant: ProtocolVariant,
    /// Code flash size in bytes.
    pub code_flash_size: usize,
    /// Data flash size in bytes.
    pub data_flash_size: usize,
    /// Unique id, when the handshake reports it.
    pub uid: Option<Vec<u8>>,
    /// Read protection is active.
    pub locked: bool,
    /// Trimmed user oscillator frequency (STC), `None` when untrimmed.
    pub osc_frequency: Option<u32>,
}

/// Outcome of an oscillator calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TrimResult {
    /// Clock divider applied to the trimmed oscillator.
    pub divisor: u8,
    /// Trim register value.
    pub trim: u8,
    /// Trim band (range) value.
    pub band: u8,
    /// Achieved frequency in Hz.
    pub frequency: u32,
    /// Relative error `(achieved - requested) / requested`.
    pub error: f64,
}

/// Where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing exchanged yet.
    #[default]
    Disconnected,
    /// Chip identified, key exchange pending.
    Identified,
    /// Handshake complete.
    Ready,
    /// Read protection lifted.
    Unlocked,
    /// Flash erased.
    Erased,
    /// Image written.
    Written,
    /// Image verified.
    Verified,
    /// Bootloader left.
    Done,
    /// A command failed; only `close` remains valid.
    Error,
    /// Transport released.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Unified interface of every protocol engine.
///
/// This trait lets the CLI and [`crate::FlashPlan`] drive any bootloader
/// through the same calls. `connect` must succeed before anything else.
pub trait Flasher {
    /// Synchronize with the bootloader and identify the chip.
    fn connect(&mut self) -> Result<ChipInfo>;

    /// Identity learned by `connect`.
    fn info(&self) -> Option<&ChipInfo>;

    /// Current session state.
    fn state(&self) -> SessionState;

    /// Erase enough code flash for `size` bytes (or the whole chip).
    fn erase(&mut self, size: usize) -> Result<()>;

    /// Program an image from the start of code flash.
    ///
    /// `progress` receives (bytes done, total bytes).
    fn write(&mut self, image: &FlashImage, progress: &mut dyn FnMut(usize, usize))
    -> Result<()>;

    /// Check flash against an image.
    fn verify(
        &mut self,
        image: &FlashImage,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()>;

    /// Whether `verify` is available for this bootloader.
    fn supports_verify(&self) -> bool {
        true
    }

    /// Remove read protection (may erase the chip).
    fn unlock(&mut self) -> Result<()>;

    /// Enable read protection.
    fn lock(&mut self) -> Result<()>;

    /// Read the option block.
    fn read_options(&mut self) -> Result<OptionBytes>;

    /// Write a whole option block.
    fn write_options(&mut self, options: &OptionBytes) -> Result<()>;

    /// Calibrate the user oscillator.
    fn trim(&mut self, frequency: u32) -> Result<TrimResult> {
        let _ = frequency;
        Err(Error::Unsupported(
            "oscillator trimming is only available for STC".into(),
        ))
    }

    /// Read the chip's unique id.
    fn read_uid(&mut self) -> Result<Vec<u8>>;

    /// Leave the bootloader (start the firmware) and release the transport.
    fn exit(&mut self) -> Result<()>;

    /// Release the transport; safe to call more than once.
    fn close(&mut self);
}
