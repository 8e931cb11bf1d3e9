//! WCH device table.
//!
//! The id is `(chip family << 8) | chip type` as reported by the detect
//! reply. Protocol quirks follow from the family byte alone.

use {
    crate::registry::{DeviceDescriptor, Quirks, Registry},
    std::sync::OnceLock,
};

/// Quirks implied by a WCH chip id.
#[allow(clippy::cast_possible_truncation)]
pub const fn quirks_for(id: u32) -> Quirks {
    let family = (id >> 8) as u8;
    let mut bits = 0;
    if family > 0x11 {
        bits |= Quirks::WIDE_UID.bits();
    }
    if family == 0x11 {
        bits |= Quirks::LEGACY_V1_PROTOCOL.bits();
    }
    if matches!(family, 0x12 | 0x14 | 0x15 | 0x17 | 0x18 | 0x19 | 0x1A | 0x23 | 0x25) {
        bits |= Quirks::NEEDS_TRAILING_EMPTY_WRITE.bits();
    }
    if matches!(family, 0x14 | 0x15 | 0x17 | 0x18 | 0x19 | 0x1A | 0x23 | 0x25) {
        bits |= Quirks::NEEDS_OPTION_BYTE_UNLOCK_REMOVAL.bits();
    }
    if id == 0x1379 {
        bits |= Quirks::NEEDS_CONFIG_FIXUP.bits();
    }
    Quirks::from_bits_retain(bits)
}

const fn wch(id: u32, name: &'static str, code: usize, data: usize) -> DeviceDescriptor {
    DeviceDescriptor::new(id, name, code, data, quirks_for(id))
}

/// Every supported WCH chip.
pub const DEVICES: &[DeviceDescriptor] = &[
    wch(0x1243, "CH543", 14336, 256),
    wch(0x1244, "CH544", 61440, 1024),
    wch(0x1245, "CH545", 61440, 1024),
    wch(0x1246, "CH546", 32768, 1024),
    wch(0x1247, "CH547", 61440, 1024),
    wch(0x1248, "CH548", 32768, 1024),
    wch(0x1249, "CH549", 61440, 1024),
    wch(0x1151, "CH551", 10240, 128),
    wch(0x1152, "CH552", 14336, 128),
    wch(0x1154, "CH554", 14336, 128),
    wch(0x1155, "CH555", 61440, 1024),
    wch(0x1156, "CH556", 61440, 1024),
    wch(0x1157, "CH557", 61440, 1024),
    wch(0x1158, "CH558", 61440, 1024),
    wch(0x1159, "CH559", 61440, 1024),
    wch(0x1373, "CH573", 458752, 32768),
    wch(0x1379, "CH579", 256000, 2048),
    wch(0x1682, "CH582", 458752, 32768),
    wch(0x1432, "CH32F103x6", 32768, 0),
    wch(0x143F, "CH32F103x8", 65536, 0),
    wch(0x1A33, "CH32F203C6T6", 32768, 0),
    wch(0x1A31, "CH32F203C8T6", 65536, 0),
    wch(0x1A30, "CH32F203C8U6", 65536, 0),
    wch(0x1832, "CH32F203CBT6", 131072, 0),
    wch(0x1A32, "CH32F203K8T6", 65536, 0),
    wch(0x1833, "CH32F203RBT6", 131072, 0),
    wch(0x1831, "CH32F203RCT6", 262144, 0),
    wch(0x1830, "CH32F203VCT6", 262144, 0),
    wch(0x1850, "CH32F205RBT6", 131072, 0),
    wch(0x1870, "CH32F207VCT6", 262144, 0),
    wch(0x1A81, "CH32F208RBT6", 131072, 0),
    wch(0x1A80, "CH32F208WBU6", 491520, 0),
    wch(0x1532, "CH32V103x6", 32768, 0),
    wch(0x153F, "CH32V103x8", 65536, 0),
    wch(0x1933, "CH32V203C6T6", 32768, 0),
    wch(0x1931, "CH32V203C8T6", 65536, 0),
    wch(0x1930, "CH32V203C8U6", 65536, 0),
    wch(0x1937, "CH32V203F6P6", 32768, 0),
    wch(0x193A, "CH32V203F8P6", 65536, 0),
    wch(0x1936, "CH32V203G6U6", 32768, 0),
    wch(0x193B, "CH32V203G8R6", 65536, 0),
    wch(0x1935, "CH32V203K6T6", 32768, 0),
    wch(0x1932, "CH32V203K8T6", 65536, 0),
    wch(0x1934, "CH32V203RBT6", 131072, 0),
    wch(0x1982, "CH32V208CBU6", 131072, 0),
    wch(0x1983, "CH32V208GBU6", 131072, 0),
    wch(0x1981, "CH32V208RBT6", 131072, 0),
    wch(0x1980, "CH32V208WBU6", 491520, 0),
    wch(0x1734, "CH32V303CBT6", 131072, 0),
    wch(0x1733, "CH32V303RBT6", 131072, 0),
    wch(0x1731, "CH32V303RCT6", 262144, 0),
    wch(0x1730, "CH32V303VCT6", 262144, 0),
    wch(0x1752, "CH32V305FBP6", 131072, 0),
    wch(0x1750, "CH32V305RBT6", 131072, 0),
    wch(0x1771, "CH32V307RCT6", 262144, 0),
    wch(0x1770, "CH32V307VCT6", 262144, 0),
    wch(0x1773, "CH32V307WCU6", 262144, 0),
    wch(0x235A, "CH32X033F8P6", 63488, 0),
    wch(0x2351, "CH32X035C8T6", 63488, 0),
    wch(0x2357, "CH32X035F7P6", 49152, 0),
    wch(0x235E, "CH32X035F8U6", 63488, 0),
    wch(0x235B, "CH32X035G8R6", 63488, 0),
    wch(0x2356, "CH32X035G8U6", 63488, 0),
    wch(0x2350, "CH32X035R8T6", 63488, 0),
    wch(0x2531, "CH32L103C8T6", 65536, 0),
    wch(0x2530, "CH32L103C8U6", 65536, 0),
    wch(0x2537, "CH32L103F7P6", 49152, 0),
    wch(0x253A, "CH32L103F8P6", 65536, 0),
    wch(0x253D, "CH32L103F8U6", 65536, 0),
    wch(0x253B, "CH32L103G8R6", 65536, 0),
    wch(0x2532, "CH32L103K8U6", 65536, 0),
];

/// The WCH registry, built on first use.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry::from_table("WCH", DEVICES))
}
