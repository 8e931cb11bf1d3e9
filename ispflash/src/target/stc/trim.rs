//! Internal RC oscillator calibration.
//!
//! The UART bootloader measures the oscillator against the host baud rate:
//! for every trim/band pair it is sent, it reports how many baud periods one
//! oscillator window took. Calibration runs in two rounds:
//!
//! 1. a coarse sweep over five fixed reference settings, from which a
//!    divider and a linear trim estimate are derived;
//! 2. a fine sweep over 24 settings around the estimate, from which the
//!    setting closest to the target is picked.
//!
//! The USB bootloader cannot measure; its parts pick from a preset table.

use {
    crate::{
        error::{Error, Result},
        target::chip::TrimResult,
    },
    std::ops::RangeInclusive,
};

/// Coarse sweep payload: five (trim, band) reference pairs.
pub const COARSE_BLOCK: [u8; 12] = [
    0x00, 0x05, 0x02, 0x00, 0x80, 0x00, 0x00, 0x80, 0x80, 0x80, 0xFD, 0x00,
];

/// Number of settings in the fine sweep.
pub const SWEEP_COUNT: usize = 24;

/// Frequencies the UART bootloader can be trimmed to.
pub const TRIM_RANGE: RangeInclusive<u32> = 128_000..=36_000_000;

/// Trim request code and reply code.
pub const TRIM_CODE: u8 = 0x00;

/// Divider and starting point of the fine sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    /// Oscillator divider.
    pub divisor: u8,
    /// Trim value in the middle of the sweep.
    pub trim: u8,
    /// Lowest band of the sweep.
    pub band: u8,
}

/// Fail with [`Error::TrimOutOfRange`] outside [`TRIM_RANGE`].
pub fn check_range(frequency: u32) -> Result<()> {
    if !TRIM_RANGE.contains(&frequency) {
        return Err(Error::TrimOutOfRange(format!(
            "{frequency} Hz is outside {} - {} Hz",
            TRIM_RANGE.start(),
            TRIM_RANGE.end()
        )));
    }
    Ok(())
}

/// Frequency measured for sweep entry `index` of a trim reply.
fn measured(reply: &[u8], index: usize, baud: u32) -> Result<u64> {
    let pos = 2 + 2 * index;
    let bytes = reply
        .get(pos..pos + 2)
        .ok_or_else(|| {
            Error::Protocol(format!(
                "trim reply too short for entry {index} ({} bytes)",
                reply.len()
            ))
        })?;
    Ok(u64::from(u16::from_be_bytes([bytes[0], bytes[1]])) * u64::from(baud))
}

fn trim_byte(value: f64) -> Result<u8> {
    let rounded = value.round_ties_even();
    // The sweep reaches two below and three above the estimate.
    if !(2.0..=252.0).contains(&rounded) {
        return Err(Error::TrimOutOfRange(format!(
            "trim estimate {rounded} is out of the adjustable range"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(rounded as u8)
}

/// Derive the divider and trim estimate from the coarse sweep reply.
#[allow(clippy::cast_precision_loss)]
pub fn estimate(target: u32, reply: &[u8], baud: u32) -> Result<Estimate> {
    let [f1, f2, f3, f4, f5] = [0, 1, 2, 3, 4].map(|i| measured(reply, i, baud));
    let (f1, f2, f3, f4, f5) = (f1?, f2?, f3?, f4?, f5?);
    if f2 <= f1 || f4 <= f3 {
        return Err(Error::Protocol(
            "coarse sweep frequencies are not increasing".into(),
        ));
    }

    let target = u64::from(target);
    let mut divisor: u64 = 1;
    while target * divisor < f1 {
        divisor += 1;
    }
    let divisor = u8::try_from(divisor).map_err(|_| {
        Error::TrimOutOfRange(format!("{target} Hz needs a divider above 255"))
    })?;
    let scaled = (target * u64::from(divisor)) as f64;

    let b = &COARSE_BLOCK;
    let (trim, band) = if target * u64::from(divisor) < f5 {
        let slope = f64::from(b[4] - b[2]) / (f2 - f1) as f64;
        ((scaled - f1 as f64) * slope + f64::from(b[2]), b[3])
    } else {
        // The high band is interpolated from its own references but offset
        // from the low band's first trim value, as the bootloader expects.
        let slope = f64::from(b[8] - b[6]) / (f4 - f3) as f64;
        ((scaled - f3 as f64) * slope + f64::from(b[2]), b[7])
    };
    Ok(Estimate {
        divisor,
        trim: trim_byte(trim)?,
        band,
    })
}

/// Trim and band of fine sweep entry `index`.
#[allow(clippy::cast_possible_truncation)]
fn sweep_entry(estimate: &Estimate, index: usize) -> (u8, u8) {
    (
        estimate.trim - 2 + (index >> 2) as u8,
        estimate.band + (index & 0x03) as u8,
    )
}

/// Fine sweep payload around `estimate`.
#[allow(clippy::cast_possible_truncation)]
pub fn sweep_block(estimate: &Estimate) -> Vec<u8> {
    let mut block = Vec::with_capacity(2 + 2 * SWEEP_COUNT);
    block.extend_from_slice(&[TRIM_CODE, SWEEP_COUNT as u8]);
    for index in 0..SWEEP_COUNT {
        let (trim, band) = sweep_entry(estimate, index);
        block.extend_from_slice(&[trim, band]);
    }
    block
}

/// Pick the fine sweep entry closest to `target`.
///
/// Ties keep the earlier entry.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn select(target: u32, estimate: &Estimate, reply: &[u8], baud: u32) -> Result<TrimResult> {
    let scaled = u64::from(target) * u64::from(estimate.divisor);
    let mut best: Option<(u64, usize, u64)> = None;
    for index in 0..SWEEP_COUNT {
        let freq = measured(reply, index, baud)?;
        let distance = scaled.abs_diff(freq);
        if best.is_none_or(|(d, _, _)| distance < d) {
            best = Some((distance, index, freq));
        }
    }
    let (_, index, freq) =
        best.ok_or_else(|| Error::Protocol("empty fine sweep reply".into()))?;

    let frequency = (freq as f64 / f64::from(estimate.divisor)).round_ties_even() as u32;
    let (trim, band) = sweep_entry(estimate, index);
    Ok(TrimResult {
        divisor: estimate.divisor,
        trim,
        band,
        frequency,
        error: (f64::from(frequency) - f64::from(target)) / f64::from(target),
    })
}

/// Preset oscillator settings of the USB bootloader.
pub const USB_PRESETS: &[(u32, [u8; 3])] = &[
    (1_000_000, [0x48, 0x20, 24]),
    (2_000_000, [0x48, 0x20, 12]),
    (3_000_000, [0x48, 0x20, 8]),
    (4_000_000, [0x48, 0x20, 6]),
    (5_000_000, [0x73, 0x30, 8]),
    (6_000_000, [0x48, 0x20, 4]),
    (8_000_000, [0x48, 0x20, 3]),
    (10_000_000, [0x73, 0x30, 4]),
    (12_000_000, [0x48, 0x20, 2]),
    (16_000_000, [0xC6, 0x30, 3]),
    (20_000_000, [0x73, 0x30, 2]),
    (24_000_000, [0x48, 0x20, 1]),
    (27_000_000, [0x7A, 0x20, 1]),
    (30_000_000, [0xB1, 0x20, 1]),
    (35_000_000, [0x44, 0x30, 1]),
    (40_000_000, [0x73, 0x30, 1]),
    (48_000_000, [0xC6, 0x30, 1]),
];

/// Look up a USB preset; only the listed frequencies are available.
pub fn usb_preset(frequency: u32) -> Result<TrimResult> {
    USB_PRESETS
        .iter()
        .find(|(f, _)| *f == frequency)
        .map(|&(frequency, [trim, band, divisor])| TrimResult {
            divisor,
            trim,
            band,
            frequency,
            error: 0.0,
        })
        .ok_or_else(|| {
            Error::TrimOutOfRange(format!(
                "{frequency} Hz is not one of the USB bootloader presets"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BAUD: u32 = 2400;

    fn reply(counts: &[u16]) -> Vec<u8> {
        let mut reply = vec![TRIM_CODE, counts.len() as u8];
        for count in counts {
            reply.extend_from_slice(&count.to_be_bytes());
        }
        reply
    }

    /// References: 19.2, 24, 30, 36 and 28.8 MHz.
    fn coarse_reply() -> Vec<u8> {
        reply(&[8000, 10000, 12500, 15000, 12000])
    }

    #[test]
    fn test_range() {
        assert!(check_range(24_000_000).is_ok());
        assert!(check_range(128_000).is_ok());
        assert!(matches!(
            check_range(127_999),
            Err(Error::TrimOutOfRange(_))
        ));
        assert!(check_range(36_000_001).is_err());
    }

    #[test]
    fn test_estimate_low_band() {
        let est = estimate(24_000_000, &coarse_reply(), BAUD).unwrap();
        assert_eq!(
            est,
            Estimate {
                divisor: 1,
                trim: 128,
                band: 0x00
            }
        );
    }

    #[test]
    fn test_estimate_divider() {
        let est = estimate(1_000_000, &coarse_reply(), BAUD).unwrap();
        assert_eq!(est.divisor, 20);
        assert_eq!(est.band, 0x00);
    }

    #[test]
    fn test_estimate_high_band() {
        // 33 MHz is above the last low-band reference.
        let est = estimate(33_000_000, &coarse_reply(), BAUD).unwrap();
        assert_eq!(est.divisor, 1);
        assert_eq!(est.band, 0x80);
        // (33 - 30) / (36 - 30) * 128 + 2
        assert_eq!(est.trim, 66);
    }

    #[test]
    fn test_sweep_block_layout() {
        let est = Estimate {
            divisor: 1,
            trim: 128,
            band: 0,
        };
        let block = sweep_block(&est);
        assert_eq!(block.len(), 50);
        assert_eq!(&block[..2], &[0x00, 24]);
        assert_eq!(&block[2..10], &[126, 0, 126, 1, 126, 2, 126, 3]);
        assert_eq!(&block[48..], &[131, 3]);
    }

    #[test]
    fn test_select_nearest_candidate_at_24mhz() {
        let est = estimate(24_000_000, &coarse_reply(), BAUD).unwrap();
        let mut counts = [9900u16; SWEEP_COUNT];
        counts[9] = 10002;
        counts[10] = 9997;
        let result = select(24_000_000, &est, &reply(&counts), BAUD).unwrap();
        assert_eq!(result.trim, 128);
        assert_eq!(result.band, 1);
        assert_eq!(result.divisor, 1);
        assert_eq!(result.frequency, 24_004_800);
        assert!((result.error - 0.0002).abs() < 1e-9);
        assert!(
            result
                .error
                .abs()
                < 0.001
        );
    }

    #[test]
    fn test_select_tie_keeps_first() {
        let est = Estimate {
            divisor: 1,
            trim: 100,
            band: 0,
        };
        let mut counts = [0u16; SWEEP_COUNT];
        counts[3] = 10001;
        counts[7] = 9999;
        let result = select(24_000_000, &est, &reply(&counts), BAUD).unwrap();
        assert_eq!((result.trim, result.band), (98, 3));
    }

    #[test]
    fn test_short_reply_is_protocol_error() {
        assert!(matches!(
            estimate(24_000_000, &[0x00, 0x05, 0x1F], BAUD),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_usb_presets() {
        assert_eq!(USB_PRESETS.len(), 17);
        let preset = usb_preset(16_000_000).unwrap();
        assert_eq!((preset.trim, preset.band, preset.divisor), (0xC6, 0x30, 3));
        assert!(matches!(
            usb_preset(25_000_000),
            Err(Error::TrimOutOfRange(_))
        ));
    }
}
