//! WCH payload scrambling.
//!
//! Bootloader v2 derives an 8-byte XOR key from the chip UID. The early
//! CH32V203 bootloader instead folds the chip type into every eighth byte of
//! each frame.

use super::checksum::sum8;

/// Key length in bytes; payloads are padded to a multiple of it.
pub const KEY_LEN: usize = 8;

/// Repeating XOR key shared with a WCH v2 bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorKey([u8; KEY_LEN]);

impl XorKey {
    /// Derive the key from the UID and the chip type byte.
    ///
    /// Bytes 0..7 hold the 8-bit sum of the UID; the last byte adds the
    /// chip type on top of it.
    pub fn derive(uid: &[u8], chip_type: u8) -> Self {
        let sum = sum8(uid);
        let mut key = [sum; KEY_LEN];
        key[KEY_LEN - 1] = sum.wrapping_add(chip_type);
        Self(key)
    }

    /// The checksum the bootloader echoes after the key-set command.
    pub fn checksum(&self) -> u8 {
        sum8(&self.0)
    }

    /// XOR `data` in place; the key is aligned to the start of `data`.
    pub fn apply(&self, data: &mut [u8]) {
        for (i, byte) in data
            .iter_mut()
            .enumerate()
        {
            *byte ^= self.0[i % KEY_LEN];
        }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// XOR `chip_type` into every byte at index ≡ 7 (mod 8) of a whole frame.
pub fn fold_chip_type(frame: &mut [u8], chip_type: u8) {
    for byte in frame
        .iter_mut()
        .skip(KEY_LEN - 1)
        .step_by(KEY_LEN)
    {
        *byte ^= chip_type;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key() {
        // CH32V203: family 0x19, type 0x31, 8-byte UID
        let uid = [0xcd, 0xab, 0x1f, 0x3c, 0x45, 0x86, 0xbc, 0x01];
        let key = XorKey::derive(&uid, 0x31);
        let sum = sum8(&uid);
        assert_eq!(&key.as_bytes()[..7], &[sum; 7]);
        assert_eq!(key.as_bytes()[7], sum.wrapping_add(0x31));
        assert_eq!(key.checksum(), sum8(key.as_bytes()));
    }

    #[test]
    fn test_apply_round_trip() {
        let key = XorKey::derive(&[1, 2, 3, 4], 0x52);
        let original: Vec<u8> = (0..=255).collect();
        let mut data = original.clone();
        key.apply(&mut data);
        assert_ne!(data, original);
        key.apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_fold_touches_every_eighth_byte() {
        let mut frame = [0u8; 20];
        fold_chip_type(&mut frame, 0x31);
        for (i, b) in frame
            .iter()
            .enumerate()
        {
            let expected = if i % 8 == 7 { 0x31 } else { 0 };
            assert_eq!(*b, expected, "index {i}");
        }
    }
}
