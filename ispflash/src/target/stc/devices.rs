//! STC8 device table.
//!
//! The id is the big-endian chip id at bytes 20..22 of the info frame.

use {
    crate::registry::{DeviceDescriptor, Quirks, Registry},
    std::sync::OnceLock,
};

const fn stc(id: u32, name: &'static str, code: usize) -> DeviceDescriptor {
    // STC8H8K*U parts carry a native USB bootloader.
    let quirks = if id >= 0xF781 && id <= 0xF785 {
        Quirks::USB_ISP
    } else {
        Quirks::empty()
    };
    DeviceDescriptor::new(id, name, code, 0, quirks)
}

/// Every supported STC chip.
pub const DEVICES: &[DeviceDescriptor] = &[
    stc(0xF721, "STC8H1K16", 16384),
    stc(0xF722, "STC8H1K20", 20480),
    stc(0xF723, "STC8H1K24", 24576),
    stc(0xF724, "STC8H1K28", 28672),
    stc(0xF725, "STC8H1K33", 33792),
    stc(0xF731, "STC8H1K02", 2048),
    stc(0xF732, "STC8H1K04", 4096),
    stc(0xF733, "STC8H1K06", 6144),
    stc(0xF734, "STC8H1K08", 8192),
    stc(0xF735, "STC8H1K10", 10240),
    stc(0xF736, "STC8H1K12", 12288),
    stc(0xF737, "STC8H1K17", 17408),
    stc(0xF741, "STC8H3K16S4", 16384),
    stc(0xF742, "STC8H3K32S4", 32768),
    stc(0xF743, "STC8H3K60S4", 61440),
    stc(0xF744, "STC8H3K64S4", 65024),
    stc(0xF745, "STC8H3K48S4", 49152),
    stc(0xF749, "STC8H3K16S2", 16384),
    stc(0xF74A, "STC8H3K32S2", 32768),
    stc(0xF74B, "STC8H3K60S2", 61440),
    stc(0xF74C, "STC8H3K64S2", 65024),
    stc(0xF74D, "STC8H3K48S2", 49152),
    stc(0xF751, "STC8G1K02-20/16P", 2048),
    stc(0xF752, "STC8G1K04-20/16P", 4096),
    stc(0xF753, "STC8G1K06-20/16P", 6144),
    stc(0xF754, "STC8G1K08-20/16P", 8192),
    stc(0xF755, "STC8G1K10-20/16P", 10240),
    stc(0xF756, "STC8G1K12-20/16P", 12288),
    stc(0xF757, "STC8G1K17-20/16P", 17408),
    stc(0xF761, "STC8G2K16S4", 16384),
    stc(0xF762, "STC8G2K32S4", 32768),
    stc(0xF763, "STC8G2K60S4", 61440),
    stc(0xF764, "STC8G2K64S4", 65024),
    stc(0xF765, "STC8G2K48S4", 49152),
    stc(0xF769, "STC8G2K16S2", 16384),
    stc(0xF76A, "STC8G2K32S2", 32768),
    stc(0xF76B, "STC8G2K60S2", 61440),
    stc(0xF76C, "STC8G2K64S2", 65024),
    stc(0xF76D, "STC8G2K48S2", 49152),
    stc(0xF771, "STC8G1K02T", 2048),
    stc(0xF772, "STC8G1K04T", 4096),
    stc(0xF773, "STC8G1K06T", 6144),
    stc(0xF774, "STC8G1K08T", 8192),
    stc(0xF775, "STC8G1K10T", 10240),
    stc(0xF776, "STC8G1K12T", 12288),
    stc(0xF777, "STC8G1K17T", 17408),
    stc(0xF781, "STC8H8K16U", 16384),
    stc(0xF782, "STC8H8K32U", 32768),
    stc(0xF783, "STC8H8K60U", 61440),
    stc(0xF784, "STC8H8K64U", 65024),
    stc(0xF785, "STC8H8K48U", 49152),
    stc(0xF791, "STC8G1K02A-8P", 2048),
    stc(0xF792, "STC8G1K04A-8P", 4096),
    stc(0xF793, "STC8G1K06A-8P", 6144),
    stc(0xF794, "STC8G1K08A-8P", 8192),
    stc(0xF795, "STC8G1K10A-8P", 10240),
    stc(0xF796, "STC8G1K12A-8P", 12288),
    stc(0xF797, "STC8G1K17A-8P", 17408),
    stc(0xF7A1, "STC8G1K02-8P", 2048),
    stc(0xF7A2, "STC8G1K04-8P", 4096),
    stc(0xF7A3, "STC8G1K06-8P", 6144),
    stc(0xF7A4, "STC8G1K08-8P", 8192),
    stc(0xF7A5, "STC8G1K10-8P", 10240),
    stc(0xF7A6, "STC8G1K12-8P", 12288),
    stc(0xF7A7, "STC8G1K17-8P", 17408),
];

/// The STC registry, built on first use.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry::from_table("STC", DEVICES))
}
