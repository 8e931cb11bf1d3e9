//! STC8 bootloader envelope.
//!
//! ## Frame Format
//!
//! ```text
//! +------+------+------+----------+---------+----------+------+
//! | 0x46 | 0xB9 | Code | Size(BE) | Payload | Sum (BE) | 0x16 |
//! +------+------+------+----------+---------+----------+------+
//! ```
//!
//! `Code` is 0x6A from host to chip and 0x68 from chip to host. `Size`
//! counts everything after `0xB9` (payload + 6). `Sum` is the 16-bit sum of
//! `Code`, both size bytes and the payload.

use {
    super::checksum::sum16,
    crate::{
        error::{Error, Result},
        port::Port,
    },
    std::time::Duration,
};

/// First frame byte.
pub const PREFIX: u8 = 0x46;
/// Second frame byte (`PREFIX ^ 0xFF`).
pub const PREFIX2: u8 = 0xB9;
/// Direction code host → chip.
pub const TX_CODE: u8 = 0x6A;
/// Direction code chip → host.
pub const RX_CODE: u8 = 0x68;
/// Last frame byte.
pub const SUFFIX: u8 = 0x16;
/// Bytes of envelope around the payload, counted by the size field.
const OVERHEAD: usize = 6;
/// Read timeout once a frame has started.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Wrap a payload into a host frame.
#[allow(clippy::cast_possible_truncation)]
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let size = (payload.len() + OVERHEAD) as u16;
    let size_be = size.to_be_bytes();
    let sum = sum16(sum16(u16::from(TX_CODE), &size_be), payload);

    let mut buf = Vec::with_capacity(payload.len() + OVERHEAD + 2);
    buf.extend_from_slice(&[PREFIX, PREFIX2, TX_CODE]);
    buf.extend_from_slice(&size_be);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&sum.to_be_bytes());
    buf.push(SUFFIX);
    buf
}

fn check_sum(size_be: [u8; 2], payload: &[u8], received: u16) -> Result<()> {
    let sum = sum16(sum16(u16::from(RX_CODE), &size_be), payload);
    if sum != received {
        return Err(Error::Protocol(format!(
            "checksum mismatch: computed 0x{sum:04x}, received 0x{received:04x}"
        )));
    }
    Ok(())
}

fn check_size(size: usize) -> Result<usize> {
    if size <= OVERHEAD {
        return Err(Error::Protocol(format!("invalid frame size {size}")));
    }
    Ok(size - OVERHEAD)
}

/// Decode a complete chip frame held in memory (one HID report).
///
/// Trailing bytes after the suffix (report padding) are ignored.
pub fn decode(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() < 5 || buf[0] != PREFIX {
        return Err(Error::Protocol("missing frame prefix".into()));
    }
    if buf[1] != PREFIX2 || buf[2] != RX_CODE {
        return Err(Error::Protocol(format!(
            "invalid frame prefix {:02x} {:02x}",
            buf[1], buf[2]
        )));
    }
    let size_be = [buf[3], buf[4]];
    let len = check_size(usize::from(u16::from_be_bytes(size_be)))?;
    let end = 5 + len;
    if buf.len() < end + 3 {
        return Err(Error::Protocol(format!(
            "truncated frame: {} of {} bytes",
            buf.len(),
            end + 3
        )));
    }
    let payload = &buf[5..end];
    check_sum(
        size_be,
        payload,
        u16::from_be_bytes([buf[end], buf[end + 1]]),
    )?;
    if buf[end + 2] != SUFFIX {
        return Err(Error::Protocol(format!(
            "invalid frame suffix 0x{:02x}",
            buf[end + 2]
        )));
    }
    Ok(payload.to_vec())
}

/// Read one chip frame from a byte stream.
///
/// Returns `Ok(None)` when nothing, or something other than a frame start,
/// arrives within the current timeout. Once the prefix byte is seen the
/// timeout is raised to [`REPLY_TIMEOUT`] and every malformed field is an
/// error.
pub fn read_frame<P: Port + ?Sized>(port: &mut P) -> Result<Option<Vec<u8>>> {
    match port.read_byte()? {
        Some(PREFIX) => {},
        _ => return Ok(None),
    }
    if port.timeout() < REPLY_TIMEOUT {
        port.set_timeout(REPLY_TIMEOUT)?;
    }

    let head = port.read_exact_bytes(4)?;
    if head[0] != PREFIX2 || head[1] != RX_CODE {
        return Err(Error::Protocol(format!(
            "invalid frame prefix {:02x} {:02x}",
            head[0], head[1]
        )));
    }
    let size_be = [head[2], head[3]];
    let len = check_size(usize::from(u16::from_be_bytes(size_be)))?;
    let payload = port.read_exact_bytes(len)?;
    let tail = port.read_exact_bytes(3)?;
    if tail[2] != SUFFIX {
        return Err(Error::Protocol(format!(
            "invalid frame suffix 0x{:02x}",
            tail[2]
        )));
    }
    check_sum(size_be, &payload, u16::from_be_bytes([tail[0], tail[1]]))?;
    Ok(Some(payload))
}

/// Read a frame that must be present.
pub fn expect_frame<P: Port + ?Sized>(port: &mut P, what: &str) -> Result<Vec<u8>> {
    read_frame(port)?.ok_or_else(|| Error::Timeout(format!("{what}: no reply from MCU")))
}

#[cfg(test)]
pub(crate) fn chip_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = encode(payload);
    frame[2] = RX_CODE;
    let size_be = [frame[3], frame[4]];
    let sum = sum16(sum16(u16::from(RX_CODE), &size_be), payload);
    let end = frame.len() - 3;
    frame[end..end + 2].copy_from_slice(&sum.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    #[test]
    fn test_encode_erase() {
        let frame = encode(&[0x03, 0x00, 0x00, 0x5A, 0xA5]);
        // size = 5 + 6 = 11, sum = 0x6a + 0x00 + 0x0b + 0x03 + 0x5a + 0xa5
        assert_eq!(
            frame,
            vec![
                0x46, 0xB9, 0x6A, 0x00, 0x0B, 0x03, 0x00, 0x00, 0x5A, 0xA5, 0x01, 0x77, 0x16
            ]
        );
    }

    #[test]
    fn test_read_frame() {
        let reply = chip_frame(&[0x02, 0x54]);
        let mut port = MockPort::new().reply(&reply);
        assert_eq!(
            read_frame(&mut port)
                .unwrap()
                .unwrap(),
            vec![0x02, 0x54]
        );
        assert_eq!(port.timeout(), REPLY_TIMEOUT);
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut reply = chip_frame(&[0x50, 0x01, 0x02, 0x03]);
        reply[6] ^= 0x10;
        let mut port = MockPort::new().reply(&reply);
        let err = read_frame(&mut port).unwrap_err();
        assert!(
            matches!(err, Error::Protocol(ref msg) if msg.contains("checksum")),
            "{err}"
        );
        assert!(decode(&reply).is_err());
    }

    #[test]
    fn test_no_frame_on_silence_or_noise() {
        let mut port = MockPort::new();
        assert!(
            read_frame(&mut port)
                .unwrap()
                .is_none()
        );
        let mut port = MockPort::new().reply(&[0x7F]);
        assert!(
            read_frame(&mut port)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_bad_suffix_and_size() {
        let mut reply = chip_frame(&[0x05]);
        let last = reply.len() - 1;
        reply[last] = 0x17;
        assert!(decode(&reply).is_err());

        let frame = [0x46, 0xB9, 0x68, 0x00, 0x06, 0x00, 0x6E, 0x16];
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn test_decode_ignores_report_padding() {
        let mut report = chip_frame(&[0x03, 0x00]);
        report.resize(64, 0);
        assert_eq!(decode(&report).unwrap(), vec![0x03, 0x00]);
    }
}
