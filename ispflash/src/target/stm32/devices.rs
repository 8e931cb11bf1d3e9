//! Device tables for the ST-style UART bootloader.
//!
//! The id is the product id returned by GET_ID. PUYA and STM32 live in
//! separate registries because the sync handshake already tells them apart.

use {
    crate::{
        option::{Complement, OptionLayout},
        registry::{DeviceDescriptor, Quirks, Registry},
    },
    std::sync::OnceLock,
};

/// PY32F0xx option block address.
pub const PUYA_OPTION_ADDR: u32 = 0x1FFF_0E80;
/// PY32F0xx UID area.
pub const PUYA_UID_ADDR: u32 = 0x1FFF_0E00;
/// Length of the PY32F0xx UID area.
pub const PUYA_UID_LEN: usize = 128;
/// PY32F0xx option block length.
pub const PUYA_OPTION_LEN: usize = 16;
/// STM32 user option block length.
pub const STM32_OPTION_LEN: usize = 8;

const PUYA_DEFAULTS: &[u8] = &[
    0xAA, 0xBE, 0x55, 0x41, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00,
];
const C0_G0_DEFAULTS: &[u8] = &[0xAA, 0xFE, 0xFF, 0xFF, 0x55, 0x01, 0x00, 0x00];
const L0_DEFAULTS: &[u8] = &[0xAA, 0x00, 0x55, 0xFF, 0x70, 0x80, 0x8F, 0x7F];
const F0_DEFAULTS: &[u8] = &[0xAA, 0x55, 0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00];

/// Every supported PUYA chip.
pub const PUYA_DEVICES: &[DeviceDescriptor] = &[DeviceDescriptor::new(
    0x440,
    "PY32F0xx",
    65536,
    0,
    Quirks::empty(),
)
.with_option(PUYA_OPTION_ADDR, PUYA_DEFAULTS)];

/// Every supported STM32 chip.
pub const STM32_DEVICES: &[DeviceDescriptor] = &[
    DeviceDescriptor::new(0x443, "STM32C011xx", 32768, 0, Quirks::BOOT_PIN_SELECT)
        .with_option(0x1FFF_7800, C0_G0_DEFAULTS),
    DeviceDescriptor::new(0x453, "STM32C031xx", 32768, 0, Quirks::BOOT_PIN_SELECT)
        .with_option(0x1FFF_7800, C0_G0_DEFAULTS),
    DeviceDescriptor::new(0x466, "STM32G03x/04x", 65536, 0, Quirks::BOOT_PIN_SELECT)
        .with_option(0x1FFF_7800, C0_G0_DEFAULTS),
    DeviceDescriptor::new(0x457, "STM32L01x/02x", 196_608, 0, Quirks::PAGE_ERASE_ONLY)
        .with_option(0x1FF8_0000, L0_DEFAULTS),
    DeviceDescriptor::new(0x444, "STM32F03xx4/6", 32768, 0, Quirks::empty())
        .with_option(0x1FFF_F800, F0_DEFAULTS),
];

/// Number of pages an STM32L0 chip erase covers.
pub const L0_ERASE_PAGES: u16 = 128;

/// The PUYA registry, built on first use.
pub fn puya_registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry::from_table("PUYA", PUYA_DEVICES))
}

/// The STM32 registry, built on first use.
pub fn stm32_registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry::from_table("STM32", STM32_DEVICES))
}

/// Option block layout of an STM32 product id.
pub fn stm32_layout(id: u32) -> OptionLayout {
    match id {
        0x457 => OptionLayout::Stm32(Complement::HalfWords),
        0x444 => OptionLayout::Stm32(Complement::PairedBytes),
        _ => OptionLayout::Stm32(Complement::UpperWord),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::option::OptionBytes};

    #[test]
    fn test_lookup() {
        assert_eq!(
            puya_registry()
                .lookup(0x440)
                .unwrap()
                .name,
            "PY32F0xx"
        );
        let l0 = stm32_registry()
            .lookup(0x457)
            .unwrap();
        assert!(l0.has(Quirks::PAGE_ERASE_ONLY));
        assert!(stm32_registry()
            .lookup(0x440)
            .is_err());
    }

    #[test]
    fn test_defaults_match_reference_words() {
        let expected = [
            (0x443, 0xFFFF_FEAA),
            (0x466, 0xFFFF_FEAA),
            (0x457, 0x8070_00AA),
            (0x444, 0x00FF_55AA),
        ];
        for (id, word) in expected {
            let desc = stm32_registry()
                .lookup(id)
                .unwrap();
            let region = desc
                .option
                .unwrap();
            let opt = OptionBytes::new(stm32_layout(id), region.defaults.to_vec(), region.defaults);
            assert_eq!(opt.word(), word, "{}", desc.name);
            assert!(!opt.is_read_protected());
        }
    }
}
