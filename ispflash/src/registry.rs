//! Device capability tables.
//!
//! Each bootloader family identifies the chip with a numeric id during the
//! handshake (WCH chip type and family, STM32/PUYA product id, STC chip id).
//! A [`Registry`] maps that id to a [`DeviceDescriptor`] carrying flash sizes
//! and the [`Quirks`] that steer the protocol engines.

use {
    crate::error::{Error, Result},
    bitflags::bitflags,
    std::collections::HashMap,
};

bitflags! {
    /// Per-device deviations from the family's default protocol behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Quirks: u32 {
        /// One extra zero-length program frame must follow the last chunk.
        const NEEDS_TRAILING_EMPTY_WRITE = 1 << 0;
        /// Config byte 0 must be rewritten from 0xFF to 0xA5 to lift read protection.
        const NEEDS_OPTION_BYTE_UNLOCK_REMOVAL = 1 << 1;
        /// UID is 8 bytes instead of 4.
        const WIDE_UID = 1 << 2;
        /// Bootloader speaks the v1 protocol (CH55x).
        const LEGACY_V1_PROTOCOL = 1 << 3;
        /// Config block needs a fixup write before erasing (CH579).
        const NEEDS_CONFIG_FIXUP = 1 << 4;
        /// nBOOT_SEL option bit must be cleared to keep the BOOT0 pin usable.
        const BOOT_PIN_SELECT = 1 << 5;
        /// No mass erase; pages are erased explicitly.
        const PAGE_ERASE_ONLY = 1 << 6;
        /// Bootloader is reached over native USB instead of UART.
        const USB_ISP = 1 << 7;
    }
}

/// Where the option-byte block lives and what the factory state looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionRegion {
    /// Absolute address of the option block.
    pub address: u32,
    /// Factory default contents.
    pub defaults: &'static [u8],
}

/// Static description of one supported chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Protocol-specific identifier reported by the bootloader.
    pub id: u32,
    /// Marketing name.
    pub name: &'static str,
    /// Code flash size in bytes.
    pub code_flash_size: usize,
    /// Data flash (EEPROM) size in bytes.
    pub data_flash_size: usize,
    /// Protocol quirks.
    pub quirks: Quirks,
    /// Option-byte region, for parts that expose one through the bootloader.
    pub option: Option<OptionRegion>,
}

impl DeviceDescriptor {
    /// Descriptor without an option region.
    pub const fn new(
        id: u32,
        name: &'static str,
        code_flash_size: usize,
        data_flash_size: usize,
        quirks: Quirks,
    ) -> Self {
        Self {
            id,
            name,
            code_flash_size,
            data_flash_size,
            quirks,
            option: None,
        }
    }

    /// Attach an option region.
    #[must_use]
    pub const fn with_option(mut self, address: u32, defaults: &'static [u8]) -> Self {
        self.option = Some(OptionRegion { address, defaults });
        self
    }

    /// Whether a quirk applies.
    pub fn has(&self, quirk: Quirks) -> bool {
        self.quirks
            .contains(quirk)
    }

    /// Fail with [`Error::InsufficientFlash`] when `len` bytes do not fit.
    pub fn check_fits(&self, len: usize) -> Result<()> {
        if len > self.code_flash_size {
            return Err(Error::InsufficientFlash {
                required: len,
                available: self.code_flash_size,
            });
        }
        Ok(())
    }
}

/// Immutable id → descriptor map for one bootloader family.
#[derive(Debug)]
pub struct Registry {
    family: &'static str,
    devices: HashMap<u32, DeviceDescriptor>,
}

impl Registry {
    /// Build a registry from a static table.
    ///
    /// Ids must be unique; a duplicate is a table bug and keeps the first entry.
    pub fn from_table(family: &'static str, table: &[DeviceDescriptor]) -> Self {
        let mut devices = HashMap::with_capacity(table.len());
        for desc in table {
            if devices
                .insert(desc.id, *desc)
                .is_some()
            {
                log::warn!("Duplicate {family} device id 0x{:04x}", desc.id);
            }
        }
        Self { family, devices }
    }

    /// Find the descriptor for an id read from hardware.
    pub fn lookup(&self, id: u32) -> Result<&DeviceDescriptor> {
        self.devices
            .get(&id)
            .ok_or(Error::UnsupportedDevice { id })
    }

    /// Family name used in log messages.
    pub fn family(&self) -> &'static str {
        self.family
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.devices
            .len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.devices
            .is_empty()
    }

    /// All descriptors sorted by id.
    pub fn devices(&self) -> Vec<&DeviceDescriptor> {
        let mut all: Vec<_> = self
            .devices
            .values()
            .collect();
        all.sort_by_key(|d| d.id);
        all
    }
}
