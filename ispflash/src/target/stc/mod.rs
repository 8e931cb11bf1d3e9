//! STC8G/STC8H bootloader support, over UART or native USB-HID.

pub mod devices;
mod flasher;
pub mod trim;

pub use flasher::StcFlasher;

/// Baud rate the bootloader is contacted and calibrated at.
pub const CALIBRATION_BAUD: u32 = 2400;
/// Default baud rate for erase and programming.
pub const TRANSFER_BAUD: u32 = 115_200;
/// VID/PID of the STC8H USB bootloader.
pub const USB_IDS: &[(u16, u16)] = &[(0x34BF, 0x1001)];
/// HID report size.
pub const REPORT_SIZE: usize = 64;
/// Programming block size.
pub const PAGE_SIZE: usize = 128;
