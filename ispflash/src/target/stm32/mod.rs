//! ST-style UART bootloader support (STM32 system memory, PUYA PY32F0xx).

pub mod devices;
mod flasher;

pub use flasher::UartFlasher;

/// Start of code flash on every supported part.
pub const CODE_ADDR: u32 = 0x0800_0000;
