//! Error types for ispflash.

use std::io;
use thiserror::Error;

/// Result type for ispflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ispflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB transfer or device access error.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No bootloader answered on the transport.
    #[error("Device not found or not in boot mode")]
    DeviceNotFound,

    /// A reply did not arrive within the read timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The chip identified itself with an id missing from the device table.
    #[error("Unsupported chip (ID: 0x{id:04x})")]
    UnsupportedDevice {
        /// Identifier reported by the bootloader.
        id: u32,
    },

    /// The configuration reply had an unexpected shape.
    #[error("Failed to read chip configuration: {0}")]
    ConfigReadFailed(String),

    /// The bootloader echoed a key checksum different from ours.
    #[error("Encryption key rejected: expected checksum 0x{expected:02x}, got 0x{actual:02x}")]
    KeyRejected {
        /// Checksum of the locally derived key.
        expected: u8,
        /// Checksum echoed by the bootloader.
        actual: u8,
    },

    /// The erase command was answered with a failure status.
    #[error("Failed to erase chip (status 0x{status:02x})")]
    EraseFailed {
        /// Status byte observed in the reply.
        status: u8,
    },

    /// A program frame was rejected.
    #[error("Failed to write at offset 0x{offset:08x} (status 0x{status:02x})")]
    WriteFailed {
        /// Offset of the rejected chunk.
        offset: u32,
        /// Status byte observed in the reply.
        status: u8,
    },

    /// Flash contents differ from the image.
    #[error("Verification failed at offset 0x{offset:08x}")]
    VerificationFailed {
        /// First mismatching offset.
        offset: u32,
    },

    /// The option byte block was not accepted.
    #[error("Failed to write option bytes")]
    OptionWriteFailed,

    /// The image does not fit into code flash.
    #[error("Not enough memory: image is {required} bytes, flash holds {available}")]
    InsufficientFlash {
        /// Image size in bytes.
        required: usize,
        /// Code flash size in bytes.
        available: usize,
    },

    /// Requested oscillator frequency cannot be reached.
    #[error("Trim frequency out of range: {0}")]
    TrimOutOfRange(String),

    /// The chip is read-protected; unlocking erases it.
    #[error("Chip is locked (read protection active)")]
    LockedChip,

    /// Malformed or negative reply (NACK, bad prefix, checksum mismatch).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported chip or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error means no usable device answered.
    pub fn is_device_missing(&self) -> bool {
        matches!(self, Self::DeviceNotFound | Self::UnsupportedDevice { .. })
    }

    /// Whether the request was turned down before anything reached the chip.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::LockedChip
                | Self::Unsupported(_)
                | Self::Config(_)
                | Self::InsufficientFlash { .. }
        )
    }
}
