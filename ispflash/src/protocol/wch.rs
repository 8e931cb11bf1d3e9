//! WCH USB bootloader framing.
//!
//! ## Frame Format (bootloader v2)
//!
//! ```text
//! +--------+---------+---------+----------------+
//! | Opcode | Len LSB | Len MSB |    Payload     |
//! +--------+---------+---------+----------------+
//! ```
//!
//! Program and verify frames carry `[address:4 LE][remaining & 0xff][data]`
//! as payload. Replies put the status at byte 4.
//!
//! Bootloader v1 (CH55x) uses a single length byte and 2-byte addresses, and
//! replies put the status at byte 0.

use {
    crate::error::{Error, Result},
    byteorder::{LittleEndian, WriteBytesExt},
};

/// Maximum payload bytes per v2 program/verify frame.
pub const CHUNK_V2: usize = 56;
/// Maximum payload bytes per v1 program/verify frame.
pub const CHUNK_V1: usize = 60;
/// Config read reply length.
pub const CONFIG_REPLY_LEN: usize = 30;
/// Config block length inside the config reply.
pub const CONFIG_LEN: usize = 12;
/// Erase granularity.
pub const ERASE_UNIT: usize = 1024;
/// Minimum number of units a v2 erase covers.
pub const MIN_ERASE_UNITS: usize = 8;

/// Identification string of the v2 detect command.
const DETECT_V2_ID: &[u8] = b"MCU ISP & WCH.CN";
/// Identification string of the v1 detect command.
const DETECT_V1_ID: &[u8] = b"USB DBG CH559 & ISP\0";

/// WCH bootloader opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Identify chip (v2).
    Identify = 0xA1,
    /// Reboot into user code (v2).
    Reboot = 0xA2,
    /// Set encryption key (v2).
    KeySet = 0xA3,
    /// Erase code flash (v2).
    CodeErase = 0xA4,
    /// Program code flash (v2).
    CodeWrite = 0xA5,
    /// Verify code flash (v2).
    CodeVerify = 0xA6,
    /// Read config block (v2).
    ConfigRead = 0xA7,
    /// Write config block (v2).
    ConfigWrite = 0xA8,
}

/// Opcodes of the v1 bootloader.
pub mod v1 {
    /// Identify chip.
    pub const IDENTIFY: u8 = 0xA2;
    /// Exit to user code.
    pub const REBOOT: u8 = 0xA5;
    /// Start erase.
    pub const ERASE: u8 = 0xA6;
    /// Verify a chunk.
    pub const VERIFY: u8 = 0xA7;
    /// Program a chunk.
    pub const WRITE: u8 = 0xA8;
    /// Erase one KiB page.
    pub const ERASE_PAGE: u8 = 0xA9;
    /// Read bootloader version.
    pub const CONFIG_READ: u8 = 0xBB;
}

/// Program or verify pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramMode {
    /// Write flash.
    Write,
    /// Compare flash against the payload inside the bootloader.
    Verify,
}

impl ProgramMode {
    /// Opcode used by bootloader v2.
    pub fn opcode_v2(self) -> u8 {
        match self {
            Self::Write => Command::CodeWrite as u8,
            Self::Verify => Command::CodeVerify as u8,
        }
    }

    /// Opcode used by bootloader v1.
    pub fn opcode_v1(self) -> u8 {
        match self {
            Self::Write => v1::WRITE,
            Self::Verify => v1::VERIFY,
        }
    }
}

/// Command frame builder for bootloader v2.
#[derive(Debug)]
pub struct WchFrame {
    opcode: u8,
    payload: Vec<u8>,
}

impl WchFrame {
    /// Create an empty frame.
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
        }
    }

    /// Detect command; a v2 bootloader answers with 6 bytes, v1 with 2.
    pub fn detect() -> Self {
        let mut frame = Self::new(Command::Identify as u8);
        frame
            .payload
            .extend_from_slice(&[0x52, 0x11]);
        frame
            .payload
            .extend_from_slice(DETECT_V2_ID);
        frame
    }

    /// Config read (`a7 02 00 1f 00`).
    pub fn config_read() -> Self {
        let mut frame = Self::new(Command::ConfigRead as u8);
        frame
            .payload
            .extend_from_slice(&[0x1F, 0x00]);
        frame
    }

    /// Key-set command; the key itself never leaves the host.
    pub fn key_set() -> Self {
        let mut frame = Self::new(Command::KeySet as u8);
        frame
            .payload
            .resize(0x1E, 0);
        frame
    }

    /// Config write of the whole 12-byte block.
    pub fn config_write(config: &[u8; CONFIG_LEN]) -> Self {
        let mut frame = Self::new(Command::ConfigWrite as u8);
        frame
            .payload
            .extend_from_slice(&[0x07, 0x00]);
        frame
            .payload
            .extend_from_slice(config);
        frame
    }

    /// Erase `units` KiB of code flash.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn erase(units: u16) -> Self {
        let mut frame = Self::new(Command::CodeErase as u8);
        frame
            .payload
            .write_u16::<LittleEndian>(units)
            .unwrap();
        frame
            .payload
            .extend_from_slice(&[0x00, 0x00]);
        frame
    }

    /// Program or verify frame.
    ///
    /// `remaining` is the number of bytes left including this chunk; only its
    /// low byte is transmitted.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn program(mode: ProgramMode, address: u32, remaining: usize, data: &[u8]) -> Self {
        let mut frame = Self::new(mode.opcode_v2());
        frame
            .payload
            .write_u32::<LittleEndian>(address)
            .unwrap();
        frame
            .payload
            .push((remaining & 0xFF) as u8);
        frame
            .payload
            .extend_from_slice(data);
        frame
    }

    /// Reboot into user code.
    pub fn reboot() -> Self {
        let mut frame = Self::new(Command::Reboot as u8);
        frame
            .payload
            .push(0x01);
        frame
    }

    /// Serialize the frame.
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let len = self
            .payload
            .len() as u16;
        let mut buf = Vec::with_capacity(3 + self.payload.len());
        buf.push(self.opcode);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Frames specific to the early CH32V203 bootloader (chprog 2.0 era).
pub mod legacy {
    use super::{Command, WchFrame};

    /// Key-set command carrying 48 copies of the UID checksum in a
    /// zero-filled 64-byte report.
    pub fn key_set(uid_checksum: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0] = Command::KeySet as u8;
        buf[1] = 0x30;
        buf[2] = 0x00;
        buf[3..3 + 0x30].fill(uid_checksum);
        buf
    }

    /// Erase `units` KiB with the two-byte payload form.
    pub fn erase(units: u16) -> Vec<u8> {
        let mut frame = WchFrame::new(Command::CodeErase as u8);
        frame
            .payload
            .extend_from_slice(&units.to_le_bytes());
        frame.build()
    }
}

/// Detect command of bootloader v1.
pub fn detect_v1() -> Vec<u8> {
    let mut buf = vec![v1::IDENTIFY, 0x13];
    buf.extend_from_slice(DETECT_V1_ID);
    buf
}

/// Bootloader version read of bootloader v1.
pub fn config_read_v1() -> Vec<u8> {
    vec![v1::CONFIG_READ, 0x00]
}

/// Erase start command of bootloader v1.
pub fn erase_start_v1() -> Vec<u8> {
    vec![v1::ERASE, 0x04, 0x00, 0x00, 0x00, 0x00]
}

/// Erase the KiB page `page` on bootloader v1.
#[allow(clippy::cast_possible_truncation)]
pub fn erase_page_v1(page: usize) -> Vec<u8> {
    vec![v1::ERASE_PAGE, 0x02, 0x00, (page * 4) as u8]
}

/// Program or verify frame of bootloader v1.
#[allow(clippy::cast_possible_truncation)]
pub fn program_v1(mode: ProgramMode, offset: usize, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.push(mode.opcode_v1());
    buf.push(data.len() as u8);
    buf.extend_from_slice(&(offset as u16).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Exit command of bootloader v1.
pub fn reboot_v1() -> Vec<u8> {
    vec![v1::REBOOT, 0x02, 0x01, 0x00]
}

/// Status byte of a v2 reply.
pub fn status_v2(reply: &[u8]) -> Result<u8> {
    reply
        .get(4)
        .copied()
        .ok_or_else(|| Error::Protocol(format!("reply too short ({} bytes)", reply.len())))
}

/// Status byte of a v1 reply.
pub fn status_v1(reply: &[u8]) -> Result<u8> {
    reply
        .first()
        .copied()
        .ok_or_else(|| Error::Protocol("empty reply".into()))
}

/// Program/verify statuses that mean "accepted" or "pending".
pub fn is_accepted(status: u8) -> bool {
    matches!(status, 0x00 | 0xFE | 0xF5)
}

/// Number of KiB units a v2 erase must cover for `size` bytes.
pub fn erase_units(size: usize) -> usize {
    size.div_ceil(ERASE_UNIT)
        .max(MIN_ERASE_UNITS)
}

/// Fields of a 30-byte v2 config reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigReply {
    /// Config block (option bytes).
    pub config: [u8; CONFIG_LEN],
    /// Bootloader version, `major.minor.patch`.
    pub bootloader: String,
    /// Unique chip id (4 or 8 bytes).
    pub uid: Vec<u8>,
}

impl ConfigReply {
    /// Parse the config reply; `uid_len` depends on the chip family.
    pub fn parse(reply: &[u8], uid_len: usize) -> Result<Self> {
        if reply.len() != CONFIG_REPLY_LEN {
            return Err(Error::ConfigReadFailed(format!(
                "expected {CONFIG_REPLY_LEN} bytes, got {}",
                reply.len()
            )));
        }
        let mut config = [0u8; CONFIG_LEN];
        config.copy_from_slice(&reply[6..6 + CONFIG_LEN]);
        Ok(Self {
            config,
            bootloader: format!("{}.{}.{}", reply[19], reply[20], reply[21]),
            uid: reply[22..22 + uid_len].to_vec(),
        })
    }
}
