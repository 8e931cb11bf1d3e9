//! Checksums used by the bootloader framings.

/// XOR of all bytes (ST/PUYA address and data parity).
pub fn xor_parity(data: &[u8]) -> u8 {
    data.iter()
        .fold(0, |acc, b| acc ^ b)
}

/// 8-bit truncated sum (WCH key checksum).
pub fn sum8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// 16-bit truncated sum starting at `init` (STC envelope).
pub fn sum16(init: u16, data: &[u8]) -> u16 {
    data.iter()
        .fold(init, |acc, &b| acc.wrapping_add(u16::from(b)))
}
