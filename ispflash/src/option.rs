//! Option bytes (device configuration block).
//!
//! The block is read once per session, edited locally through named
//! mutators and written back whole. STM32 layouts keep an inverted copy of
//! every value; the mutators rewrite it so the block is always consistent.

use {
    crate::error::{Error, Result},
    std::fmt,
};

/// How an STM32 option block stores its complement copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complement {
    /// Bytes 4..8 invert bytes 0..4 (C0, G0).
    UpperWord,
    /// Each 16-bit half-word is followed by its inverse (L0).
    HalfWords,
    /// Every byte is followed by its inverse (F0).
    PairedBytes,
}

/// Layout of an option block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionLayout {
    /// 12-byte WCH config block.
    WchConfig,
    /// 16-byte PY32F0xx block (OPTR, SDKR, WRPR with inverses).
    Puya,
    /// 8-byte STM32 user option block.
    Stm32(Complement),
    /// STC option bytes: read-only as reported in the info frame, or the
    /// block built from a trim result.
    Stc,
}

impl OptionLayout {
    /// Bytes the named edits and decoders rely on.
    pub fn min_len(self) -> usize {
        match self {
            Self::WchConfig => 12,
            Self::Puya => 16,
            Self::Stm32(_) => 8,
            Self::Stc => 0,
        }
    }
}

/// Function of the nRST pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPinMode {
    /// Pin is a general purpose I/O.
    Gpio,
    /// Pin resets the chip.
    Reset,
}

/// One requested option edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionEdit {
    /// Enable or clear read protection.
    ReadProtection(bool),
    /// Restore factory defaults.
    ResetToDefaults,
    /// Select the nRST pin function.
    ResetPin(ResetPinMode),
    /// Make the BOOT0 pin select the boot source.
    EnableBootPin,
}

/// WCH: value of config byte 0 when the chip is not read protected.
const WCH_RDPR_OPEN: u8 = 0xA5;
/// WCH: erased config byte 0.
const WCH_RDPR_ERASED: u8 = 0xFF;
/// ST/PUYA: RDP level 0.
const RDP_LEVEL0: u8 = 0xAA;
/// ST/PUYA: RDP level 1.
const RDP_LEVEL1: u8 = 0x55;

/// An option block with its layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionBytes {
    layout: OptionLayout,
    bytes: Vec<u8>,
    defaults: &'static [u8],
}

impl OptionBytes {
    /// Wrap a block read from the chip.
    pub fn new(layout: OptionLayout, bytes: Vec<u8>, defaults: &'static [u8]) -> Self {
        Self {
            layout,
            bytes,
            defaults,
        }
    }

    /// Block layout.
    pub fn layout(&self) -> OptionLayout {
        self.layout
    }

    /// Raw bytes, complement included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn unsupported(&self, what: &str) -> Error {
        Error::Unsupported(format!("{what} is not available for {:?} option bytes", self.layout))
    }

    fn is_complete(&self) -> bool {
        self.bytes
            .len()
            >= self
                .layout
                .min_len()
    }

    fn require_complete(&self) -> Result<()> {
        if !self.is_complete() {
            return Err(Error::Config(format!(
                "{:?} option block needs {} bytes, got {}",
                self.layout,
                self.layout
                    .min_len(),
                self.bytes
                    .len()
            )));
        }
        Ok(())
    }

    /// Whether the block reports active read protection.
    pub fn is_read_protected(&self) -> bool {
        let Some(&rdp) = self
            .bytes
            .first()
        else {
            return false;
        };
        match self.layout {
            OptionLayout::WchConfig => rdp == WCH_RDPR_ERASED,
            OptionLayout::Puya | OptionLayout::Stm32(_) => rdp != RDP_LEVEL0,
            OptionLayout::Stc => false,
        }
    }

    /// Set or clear read protection.
    ///
    /// WCH blocks can only be opened (0xFF → 0xA5); an already open block is
    /// left alone.
    pub fn set_read_protection(&mut self, enabled: bool) -> Result<()> {
        self.require_complete()?;
        match (self.layout, enabled) {
            (OptionLayout::WchConfig, false) => {
                if self.bytes[0] == WCH_RDPR_ERASED {
                    self.bytes[0] = WCH_RDPR_OPEN;
                }
            },
            (OptionLayout::Puya, true) => {
                self.bytes[0] = RDP_LEVEL1;
                self.bytes[2] = RDP_LEVEL0;
            },
            (OptionLayout::Puya, false) => {
                self.bytes[0] = RDP_LEVEL0;
                self.bytes[2] = RDP_LEVEL1;
            },
            (OptionLayout::Stm32(_), enabled) => {
                self.bytes[0] = if enabled { RDP_LEVEL1 } else { RDP_LEVEL0 };
                self.fix_complement();
            },
            _ => return Err(self.unsupported("read protection")),
        }
        Ok(())
    }

    /// Restore factory defaults.
    pub fn reset_to_defaults(&mut self) -> Result<()> {
        if self
            .defaults
            .is_empty()
        {
            return Err(self.unsupported("factory reset"));
        }
        self.bytes = self
            .defaults
            .to_vec();
        Ok(())
    }

    /// Select the nRST pin function.
    pub fn set_reset_pin(&mut self, mode: ResetPinMode) -> Result<()> {
        self.require_complete()?;
        match self.layout {
            OptionLayout::Puya => match mode {
                ResetPinMode::Gpio => {
                    self.bytes[1] |= 0x40;
                    self.bytes[3] &= 0xBF;
                },
                ResetPinMode::Reset => {
                    self.bytes[1] &= 0xBF;
                    self.bytes[3] |= 0x40;
                },
            },
            OptionLayout::Stm32(Complement::UpperWord) => {
                // NRST_MODE lives in bits 3..4 of the fourth byte.
                let bits = match mode {
                    ResetPinMode::Gpio => 0b0001_0000,
                    ResetPinMode::Reset => 0b0001_1000,
                };
                self.bytes[3] = (self.bytes[3] & 0b1110_0111) | bits;
                self.fix_complement();
            },
            _ => return Err(self.unsupported("reset pin mode")),
        }
        Ok(())
    }

    /// Whether nBOOT_SEL is set, making the BOOT0 pin ineffective.
    pub fn boot_pin_disabled(&self) -> bool {
        matches!(self.layout, OptionLayout::Stm32(Complement::UpperWord))
            && self.is_complete()
            && self.bytes[3] & 0x01 == 0x01
    }

    /// Clear nBOOT_SEL so BOOT0 selects the boot source.
    pub fn enable_boot_pin(&mut self) -> Result<()> {
        if !matches!(self.layout, OptionLayout::Stm32(Complement::UpperWord)) {
            return Err(self.unsupported("boot pin selection"));
        }
        self.require_complete()?;
        self.bytes[3] = (self.bytes[3] & 0b1111_1000) | 0b0000_0110;
        self.fix_complement();
        Ok(())
    }

    /// Apply one edit.
    pub fn apply(&mut self, edit: OptionEdit) -> Result<()> {
        match edit {
            OptionEdit::ReadProtection(enabled) => self.set_read_protection(enabled),
            OptionEdit::ResetToDefaults => self.reset_to_defaults(),
            OptionEdit::ResetPin(mode) => self.set_reset_pin(mode),
            OptionEdit::EnableBootPin => self.enable_boot_pin(),
        }
    }

    fn fix_complement(&mut self) {
        let b = &mut self.bytes;
        match self.layout {
            OptionLayout::Stm32(Complement::UpperWord) => {
                for i in 0..4 {
                    b[i + 4] = !b[i];
                }
            },
            OptionLayout::Stm32(Complement::HalfWords) => {
                b[2] = !b[0];
                b[3] = !b[1];
                b[6] = !b[4];
                b[7] = !b[5];
            },
            OptionLayout::Stm32(Complement::PairedBytes) => {
                for i in (0..8).step_by(2) {
                    b[i + 1] = !b[i];
                }
            },
            _ => {},
        }
    }

    /// User option word as shown by vendor tools.
    pub fn word(&self) -> u32 {
        let b = &self.bytes;
        match self.layout {
            OptionLayout::Stm32(Complement::HalfWords) if self.is_complete() => {
                u32::from(u16::from_le_bytes([b[0], b[1]]))
                    | (u32::from(u16::from_le_bytes([b[4], b[5]])) << 16)
            },
            _ if b.len() >= 4 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            _ => 0,
        }
    }
}

impl fmt::Display for OptionBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        match self.layout {
            OptionLayout::Puya if self.is_complete() => write!(
                f,
                "OPTR: 0x{:04x}, SDKR: 0x{:04x}, WRPR: 0x{:04x}",
                u16::from_be_bytes([b[0], b[1]]),
                u16::from_be_bytes([b[4], b[5]]),
                u16::from_be_bytes([b[12], b[13]])
            ),
            OptionLayout::Stm32(_) => write!(f, "0x{:08x}", self.word()),
            _ => {
                for (i, byte) in b
                    .iter()
                    .enumerate()
                {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUYA_DEFAULTS: &[u8] = &[
        0xAA, 0xBE, 0x55, 0x41, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
        0x00,
    ];
    const G0_DEFAULTS: &[u8] = &[0xAA, 0xFE, 0xFF, 0xFF, 0x55, 0x01, 0x00, 0x00];

    #[test]
    fn test_wch_unlock_only_touches_erased_byte() {
        let mut cfg = OptionBytes::new(OptionLayout::WchConfig, vec![0xFF; 12], &[]);
        assert!(cfg.is_read_protected());
        cfg.set_read_protection(false)
            .unwrap();
        assert_eq!(cfg.as_bytes()[0], 0xA5);
        assert!(!cfg.is_read_protected());

        let mut cfg = OptionBytes::new(OptionLayout::WchConfig, vec![0x5A; 12], &[]);
        cfg.set_read_protection(false)
            .unwrap();
        assert_eq!(cfg.as_bytes()[0], 0x5A);
        assert!(
            cfg.set_read_protection(true)
                .is_err()
        );
    }

    #[test]
    fn test_puya_edits() {
        let mut opt = OptionBytes::new(OptionLayout::Puya, PUYA_DEFAULTS.to_vec(), PUYA_DEFAULTS);
        opt.set_reset_pin(ResetPinMode::Gpio)
            .unwrap();
        assert_eq!(opt.as_bytes()[1], 0xFE);
        assert_eq!(opt.as_bytes()[3], 0x01);
        opt.set_read_protection(true)
            .unwrap();
        assert_eq!(opt.as_bytes()[0], 0x55);
        assert_eq!(opt.as_bytes()[2], 0xAA);
        assert!(opt.is_read_protected());
        opt.reset_to_defaults()
            .unwrap();
        assert_eq!(opt.as_bytes(), PUYA_DEFAULTS);
        assert_eq!(
            opt.to_string(),
            "OPTR: 0xaabe, SDKR: 0xff00, WRPR: 0xffff"
        );
    }

    #[test]
    fn test_stm32_boot_pin_and_complement() {
        let mut bytes = G0_DEFAULTS.to_vec();
        bytes[3] = 0xFF;
        bytes[7] = 0x00;
        let mut opt = OptionBytes::new(
            OptionLayout::Stm32(Complement::UpperWord),
            bytes,
            G0_DEFAULTS,
        );
        assert!(opt.boot_pin_disabled());
        opt.enable_boot_pin()
            .unwrap();
        assert!(!opt.boot_pin_disabled());
        assert_eq!(opt.as_bytes()[3], 0xFE);
        assert_eq!(opt.as_bytes()[7], 0x01);
        for i in 0..4 {
            assert_eq!(opt.as_bytes()[i] ^ opt.as_bytes()[i + 4], 0xFF);
        }
    }

    #[test]
    fn test_stm32_reset_pin_modes() {
        let mut opt = OptionBytes::new(
            OptionLayout::Stm32(Complement::UpperWord),
            G0_DEFAULTS.to_vec(),
            G0_DEFAULTS,
        );
        opt.set_reset_pin(ResetPinMode::Gpio)
            .unwrap();
        assert_eq!(opt.as_bytes()[3] & 0x18, 0x10);
        opt.set_reset_pin(ResetPinMode::Reset)
            .unwrap();
        assert_eq!(opt.as_bytes()[3] & 0x18, 0x18);
        assert_eq!(opt.as_bytes()[7], !opt.as_bytes()[3]);
    }

    #[test]
    fn test_l0_word_and_complement() {
        let defaults: &'static [u8] = &[0xAA, 0x00, 0x55, 0xFF, 0x70, 0x80, 0x8F, 0x7F];
        let mut opt = OptionBytes::new(
            OptionLayout::Stm32(Complement::HalfWords),
            defaults.to_vec(),
            defaults,
        );
        assert_eq!(opt.word(), 0x807000AA);
        opt.set_read_protection(true)
            .unwrap();
        assert_eq!(&opt.as_bytes()[..4], &[0x55, 0x00, 0xAA, 0xFF]);
        assert!(
            opt.set_reset_pin(ResetPinMode::Gpio)
                .is_err()
        );
        assert!(
            opt.enable_boot_pin()
                .is_err()
        );
    }

    #[test]
    fn test_short_block_is_rejected() {
        let mut opt = OptionBytes::new(OptionLayout::Puya, vec![0xAA], PUYA_DEFAULTS);
        assert!(matches!(
            opt.set_read_protection(true),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            opt.set_reset_pin(ResetPinMode::Reset),
            Err(Error::Config(_))
        ));
        assert!(!opt.is_read_protected());
        assert_eq!(opt.to_string(), "aa");

        let mut opt = OptionBytes::new(
            OptionLayout::Stm32(Complement::UpperWord),
            vec![0xAA, 0xFE, 0xFF],
            G0_DEFAULTS,
        );
        assert!(matches!(opt.enable_boot_pin(), Err(Error::Config(_))));
        assert!(!opt.boot_pin_disabled());
        assert_eq!(opt.word(), 0);
        opt.reset_to_defaults()
            .unwrap();
        opt.set_read_protection(true)
            .unwrap();
        assert_eq!(opt.as_bytes()[4], 0xAA);

        let mut empty = OptionBytes::new(OptionLayout::WchConfig, Vec::new(), &[]);
        assert!(!empty.is_read_protected());
        assert!(matches!(
            empty.set_read_protection(false),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_stc_block_is_read_only() {
        let mut opt = OptionBytes::new(OptionLayout::Stc, vec![0xFF, 0x3F, 0xF7, 0xBF, 0xFF], &[]);
        assert!(
            opt.apply(OptionEdit::ReadProtection(true))
                .is_err()
        );
        assert!(
            opt.apply(OptionEdit::ResetToDefaults)
                .is_err()
        );
        assert_eq!(opt.to_string(), "ff 3f f7 bf ff");
    }
}
