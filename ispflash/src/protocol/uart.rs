//! Parity-terminated framing of the ST-style UART bootloader.
//!
//! STM32 system memory bootloaders and the PUYA PY32F0xx ROM loader share
//! this protocol (AN3155). Every frame is answered by a single ACK byte.
//!
//! ```text
//! command: [opcode][opcode ^ 0xFF]                    -> ACK
//! address: [addr:4 BE][xor(addr)]                     -> ACK
//! data:    [n - 1][data: n][(n - 1) ^ xor(data)]      -> ACK
//! ```

use {
    super::checksum::xor_parity,
    crate::{
        error::{Error, Result},
        port::Port,
    },
    log::trace,
};

/// Synchronization byte; the bootloader detects the baud rate from it.
pub const SYNC: u8 = 0x7F;
/// Positive acknowledge.
pub const ACK: u8 = 0x79;
/// Negative acknowledge.
pub const NACK: u8 = 0x1F;
/// Busy indication (PUYA).
pub const BUSY: u8 = 0xAA;

/// Bootloader opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Bootloader version and supported commands.
    Get = 0x00,
    /// Bootloader version and read protection status.
    GetVersion = 0x01,
    /// Product id.
    GetId = 0x02,
    /// Read memory.
    ReadMemory = 0x11,
    /// Jump to user code.
    Go = 0x21,
    /// Write memory.
    WriteMemory = 0x31,
    /// Legacy erase.
    Erase = 0x43,
    /// Extended erase.
    ExtendedErase = 0x44,
    /// Enable readout protection.
    ReadoutProtect = 0x82,
    /// Disable readout protection (mass erase).
    ReadoutUnprotect = 0x92,
}

/// Encode a command.
pub fn encode_command(opcode: u8) -> [u8; 2] {
    [opcode, opcode ^ 0xFF]
}

/// Encode an address with trailing parity.
pub fn encode_address(address: u32) -> [u8; 5] {
    let be = address.to_be_bytes();
    [be[0], be[1], be[2], be[3], xor_parity(&be)]
}

/// Encode a write block of 1..=256 bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_block(data: &[u8]) -> Vec<u8> {
    let n = (data.len() - 1) as u8;
    let mut buf = Vec::with_capacity(data.len() + 2);
    buf.push(n);
    buf.extend_from_slice(data);
    buf.push(n ^ xor_parity(data));
    buf
}

/// Mass erase payload of the extended erase command.
pub const MASS_ERASE_EXTENDED: [u8; 3] = [0xFF, 0xFF, 0x00];
/// Mass erase payload of the legacy erase command.
pub const MASS_ERASE_LEGACY: [u8; 2] = [0xFF, 0x00];

/// Extended erase payload listing pages `0..count`.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_page_erase(count: u16) -> Vec<u8> {
    let last = count.saturating_sub(1);
    let mut buf = Vec::with_capacity(2 * usize::from(count) + 3);
    buf.extend_from_slice(&last.to_be_bytes());
    for page in 0..count {
        buf.extend_from_slice(&page.to_be_bytes());
    }
    let parity = xor_parity(&buf);
    buf.push(parity);
    buf
}

/// Read one byte and require ACK.
pub fn expect_ack<P: Port + ?Sized>(port: &mut P, what: &str) -> Result<()> {
    match port.read_byte()? {
        Some(ACK) => Ok(()),
        Some(NACK) => Err(Error::Protocol(format!("{what}: NACK"))),
        Some(other) => Err(Error::Protocol(format!(
            "{what}: unexpected reply 0x{other:02x}"
        ))),
        None => Err(Error::Timeout(format!("{what}: no acknowledge"))),
    }
}

/// Send a command and wait for ACK.
pub fn send_command<P: Port + ?Sized>(port: &mut P, opcode: u8) -> Result<()> {
    trace!("UART bootloader command 0x{opcode:02x}");
    port.write_all_bytes(&encode_command(opcode))?;
    expect_ack(port, &format!("command 0x{opcode:02x}"))
}

/// Send an address and wait for ACK.
pub fn send_address<P: Port + ?Sized>(port: &mut P, address: u32) -> Result<()> {
    port.write_all_bytes(&encode_address(address))?;
    expect_ack(port, &format!("address 0x{address:08x}"))
}

/// Run an info command: `[len]` followed by `len + 1` bytes and ACK.
pub fn read_info<P: Port + ?Sized>(port: &mut P, opcode: u8) -> Result<Vec<u8>> {
    send_command(port, opcode)?;
    let len = port.read_exact_bytes(1)?[0];
    let data = port.read_exact_bytes(usize::from(len) + 1)?;
    expect_ack(port, &format!("info 0x{opcode:02x}"))?;
    Ok(data)
}
