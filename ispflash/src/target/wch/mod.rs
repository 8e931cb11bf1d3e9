//! WCH CH5xx/CH32 USB bootloader support.

pub mod devices;
mod flasher;

pub use flasher::WchFlasher;

/// VID/PID pairs the bootloader enumerates with.
pub const USB_IDS: &[(u16, u16)] = &[(0x4348, 0x55E0), (0x1A86, 0x55E0)];
/// Bulk OUT endpoint.
pub const EP_OUT: u8 = 0x02;
/// Bulk IN endpoint.
pub const EP_IN: u8 = 0x82;
/// Largest reply packet.
pub const PACKET_SIZE: usize = 64;
