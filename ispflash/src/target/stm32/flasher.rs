//! UART bootloader flasher shared by STM32 and PUYA parts.
//!
//! Both speak the AN3155 command set at 115200 baud 8E1. The differences are
//! small enough to branch on [`ProtocolVariant`]:
//!
//! | | STM32 | PUYA |
//! |---|---|---|
//! | block size | 256 | 128 |
//! | sync check | ACK | ACK, then NACK for a second sync |
//! | lock | readout-protect command | RDP byte in the option block |
//! | erase | extended, legacy or page erase | extended mass erase |

use {
    super::{
        CODE_ADDR,
        devices::{
            L0_ERASE_PAGES, PUYA_OPTION_LEN, PUYA_UID_ADDR, PUYA_UID_LEN, STM32_OPTION_LEN,
            puya_registry, stm32_layout, stm32_registry,
        },
    },
    crate::{
        error::{Error, Result},
        image::{FlashImage, chunks},
        option::{OptionBytes, OptionLayout},
        port::Port,
        protocol::uart::{self, ACK, Command, NACK, SYNC},
        registry::{DeviceDescriptor, OptionRegion, Quirks},
        target::{
            chip::{ChipInfo, Flasher, ProtocolVariant, SessionState},
            session::Session,
        },
    },
    log::{debug, info, warn},
};

/// Write alignment; G0/C0 program flash in double words.
const WRITE_ALIGN: usize = 8;

/// Flasher for the ST-style UART bootloader.
pub struct UartFlasher<P: Port> {
    session: Session<P>,
    variant: ProtocolVariant,
    commands: Vec<u8>,
    options: Option<OptionBytes>,
    /// Set once an option write or lock made the chip reload and reset.
    reset_pending: bool,
}

impl<P: Port> UartFlasher<P> {
    fn new(port: P, variant: ProtocolVariant) -> Self {
        Self {
            session: Session::new(port),
            variant,
            commands: Vec::new(),
            options: None,
            reset_pending: false,
        }
    }

    /// Flasher for a PY32F0xx ROM bootloader.
    pub fn puya(port: P) -> Self {
        Self::new(port, ProtocolVariant::Puya)
    }

    /// Flasher for an STM32 system memory bootloader.
    pub fn stm32(port: P) -> Self {
        Self::new(port, ProtocolVariant::Stm32)
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.session
            .port_ref()
    }

    fn is_puya(&self) -> bool {
        self.variant == ProtocolVariant::Puya
    }

    fn option_layout(&self, id: u32) -> OptionLayout {
        if self.is_puya() {
            OptionLayout::Puya
        } else {
            stm32_layout(id)
        }
    }

    fn option_len(&self) -> usize {
        if self.is_puya() {
            PUYA_OPTION_LEN
        } else {
            STM32_OPTION_LEN
        }
    }

    fn option_region(&self) -> Result<OptionRegion> {
        self.session
            .device()?
            .option
            .ok_or_else(|| Error::Unsupported("no option bytes on this part".into()))
    }

    fn is_locked(&self) -> bool {
        self.session
            .info()
            .is_some_and(|info| info.locked)
    }

    fn require_unlocked(&self) -> Result<()> {
        self.session
            .require_ready()?;
        if self.is_locked() {
            return Err(Error::LockedChip);
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        let port = self
            .session
            .port()?;
        port.clear_buffers()?;
        port.write_all_bytes(&[SYNC])?;
        match uart::expect_ack(port, "sync") {
            Ok(()) => {},
            Err(Error::Timeout(_)) => return Err(Error::DeviceNotFound),
            Err(e) => return Err(e),
        }
        if self.variant == ProtocolVariant::Puya {
            // A synced PY32 loader rejects further sync bytes.
            let port = self
                .session
                .port()?;
            port.write_all_bytes(&[SYNC, SYNC])?;
            if port.read_byte()? != Some(NACK) {
                return Err(Error::DeviceNotFound);
            }
        }
        Ok(())
    }

    /// Read `len` bytes starting at `address` in bootloader-sized blocks.
    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let block = self
            .variant
            .chunk_size();
        let mut data = Vec::with_capacity(len);
        let mut addr = address;
        while data.len() < len {
            crate::check_interrupted()?;
            let n = (len - data.len()).min(block);
            let port = self
                .session
                .port()?;
            uart::send_command(port, Command::ReadMemory as u8)?;
            uart::send_address(port, addr)?;
            #[allow(clippy::cast_possible_truncation)]
            uart::send_command(port, (n - 1) as u8)?;
            data.extend(port.read_exact_bytes(n)?);
            addr += offset_u32(n);
        }
        Ok(data)
    }

    /// Write one block of at most 256 bytes; the reply byte on failure.
    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<Option<u8>> {
        let port = self
            .session
            .port()?;
        uart::send_command(port, Command::WriteMemory as u8)?;
        uart::send_address(port, address)?;
        port.write_all_bytes(&uart::encode_block(data))?;
        match port.read_byte()? {
            Some(ACK) => Ok(None),
            Some(status) => Ok(Some(status)),
            None => Err(Error::Timeout(format!(
                "write at 0x{address:08x}: no acknowledge"
            ))),
        }
    }

    /// Read the option block; `None` when read protection blocks the read.
    fn fetch_options(&mut self) -> Result<Option<OptionBytes>> {
        let region = self.option_region()?;
        let id = self
            .session
            .device()?
            .id;
        match self.read_memory(region.address, self.option_len()) {
            Ok(bytes) => Ok(Some(OptionBytes::new(
                self.option_layout(id),
                bytes,
                region.defaults,
            ))),
            Err(Error::Protocol(e) | Error::Timeout(e)) => {
                debug!("Option read refused: {e}");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    fn do_connect(&mut self) -> Result<ChipInfo> {
        info!(
            "Synchronizing with {} bootloader on {}",
            self.variant,
            self.port().name()
        );
        self.sync()?;

        let get = uart::read_info(self.session.port()?, Command::Get as u8)?;
        let (version, commands) = get
            .split_first()
            .ok_or_else(|| Error::Protocol("empty GET reply".into()))?;
        self.commands = commands.to_vec();
        let bootloader = format!("{:x}.{:x}", version >> 4, version & 0x07);

        let pid = uart::read_info(self.session.port()?, Command::GetId as u8)?
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        let registry = if self.is_puya() {
            puya_registry()
        } else {
            stm32_registry()
        };
        let device: DeviceDescriptor = *registry.lookup(pid)?;
        debug!("Product id 0x{pid:03x}: {}", device.name);

        let info = ChipInfo {
            name: device
                .name
                .to_string(),
            id: pid,
            bootloader,
            variant: self.variant,
            code_flash_size: device.code_flash_size,
            data_flash_size: device.data_flash_size,
            uid: None,
            locked: false,
            osc_frequency: None,
        };
        self.session
            .identify(device, info);

        self.options = self.fetch_options()?;
        let locked = self
            .options
            .is_none();
        let info = self
            .session
            .info_mut()
            .ok_or_else(|| Error::Protocol("not connected".into()))?;
        info.locked = locked;
        let info = info.clone();

        if locked {
            warn!("{} is read protected", info.name);
        }
        info!("Found {} with bootloader v{}", info.name, info.bootloader);
        self.session
            .advance(SessionState::Ready);
        Ok(info)
    }

    fn do_erase(&mut self, size: usize) -> Result<()> {
        self.require_unlocked()?;
        let device = *self
            .session
            .device()?;
        device.check_fits(size)?;

        let (opcode, payload) = if device.has(Quirks::PAGE_ERASE_ONLY) {
            (
                Command::ExtendedErase,
                uart::encode_page_erase(L0_ERASE_PAGES),
            )
        } else if self
            .commands
            .contains(&(Command::ExtendedErase as u8))
        {
            (Command::ExtendedErase, uart::MASS_ERASE_EXTENDED.to_vec())
        } else {
            (Command::Erase, uart::MASS_ERASE_LEGACY.to_vec())
        };
        info!("Erasing {}", device.name);
        let port = self
            .session
            .port()?;
        uart::send_command(port, opcode as u8)?;
        port.write_all_bytes(&payload)?;
        match port.read_byte()? {
            Some(ACK) => {},
            Some(status) => return Err(Error::EraseFailed { status }),
            None => return Err(Error::Timeout("erase: no acknowledge".into())),
        }
        self.session
            .advance(SessionState::Erased);
        Ok(())
    }

    fn do_write(
        &mut self,
        image: &FlashImage,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        self.require_unlocked()?;
        self.session
            .device()?
            .check_fits(image.len())?;

        let data = image.padded(WRITE_ALIGN);
        let total = data.len();
        for chunk in chunks(&data, self.variant.chunk_size()) {
            crate::check_interrupted()?;
            let offset = offset_u32(chunk.offset);
            if let Some(status) = self.write_block(CODE_ADDR + offset, chunk.data)? {
                return Err(Error::WriteFailed { offset, status });
            }
            progress(chunk.offset + chunk.data.len(), total);
        }
        self.session
            .advance(SessionState::Written);
        Ok(())
    }

    fn do_verify(
        &mut self,
        image: &FlashImage,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        self.require_unlocked()?;
        let expected = image.as_bytes();
        let total = expected.len();
        for chunk in chunks(expected, self.variant.chunk_size()) {
            let offset = offset_u32(chunk.offset);
            let actual = self.read_memory(CODE_ADDR + offset, chunk.data.len())?;
            if let Some(pos) = actual
                .iter()
                .zip(chunk.data)
                .position(|(a, b)| a != b)
            {
                return Err(Error::VerificationFailed {
                    offset: offset + offset_u32(pos),
                });
            }
            progress(chunk.offset + chunk.data.len(), total);
        }
        self.session
            .advance(SessionState::Verified);
        Ok(())
    }

    fn do_unlock(&mut self) -> Result<()> {
        self.session
            .require_ready()?;
        if !self.is_locked() {
            info!("Chip is already unlocked");
            return Ok(());
        }
        info!("Removing read protection (erases the chip)");
        let port = self
            .session
            .port()?;
        uart::send_command(port, Command::ReadoutUnprotect as u8)?;
        uart::expect_ack(port, "readout unprotect")?;
        // The chip resets after the mass erase; the next sync byte must go
        // through the normal command path.
        uart::send_command(port, SYNC)?;

        self.options = self.fetch_options()?;
        if self
            .options
            .is_none()
        {
            return Err(Error::Protocol(
                "chip is still read protected after unlock".into(),
            ));
        }
        if let Some(info) = self
            .session
            .info_mut()
        {
            info.locked = false;
        }
        self.session
            .advance(SessionState::Unlocked);
        Ok(())
    }

    fn do_lock(&mut self) -> Result<()> {
        self.session
            .require_ready()?;
        if self.is_locked() {
            info!("Read protection already active");
            return Ok(());
        }
        if self.is_puya() {
            let mut options = self.current_options()?;
            options.set_read_protection(true)?;
            return self.do_write_options(&options);
        }
        let port = self
            .session
            .port()?;
        uart::send_command(port, Command::ReadoutProtect as u8)?;
        uart::expect_ack(port, "readout protect")?;
        info!("Read protection set; a power-on reset may be needed");
        self.reset_pending = true;
        Ok(())
    }

    fn current_options(&self) -> Result<OptionBytes> {
        if self.is_locked() {
            return Err(Error::LockedChip);
        }
        self.options
            .clone()
            .ok_or_else(|| Error::Protocol("option bytes not read".into()))
    }

    fn do_write_options(&mut self, options: &OptionBytes) -> Result<()> {
        self.require_unlocked()?;
        let region = self.option_region()?;
        let id = self
            .session
            .device()?
            .id;
        if options.layout() != self.option_layout(id)
            || options
                .as_bytes()
                .len()
                != self.option_len()
        {
            return Err(Error::Config(format!(
                "{:?} option block does not match this chip",
                options.layout()
            )));
        }
        debug!("Writing option bytes: {options}");
        if let Some(status) = self.write_block(region.address, options.as_bytes())? {
            debug!("Option write rejected with 0x{status:02x}");
            return Err(Error::OptionWriteFailed);
        }
        self.options = Some(options.clone());
        self.reset_pending = true;
        Ok(())
    }

    fn do_read_uid(&mut self) -> Result<Vec<u8>> {
        self.require_unlocked()?;
        if !self.is_puya() {
            return Err(Error::Unsupported(
                "the STM32 bootloader does not expose the UID".into(),
            ));
        }
        let uid = self.read_memory(PUYA_UID_ADDR, PUYA_UID_LEN)?;
        if let Some(info) = self
            .session
            .info_mut()
        {
            info.uid = Some(uid.clone());
        }
        Ok(uid)
    }

    fn do_exit(&mut self) -> Result<()> {
        self.session
            .require_ready()?;
        if self.reset_pending {
            debug!("Chip resets by itself after the option reload");
        } else {
            let port = self
                .session
                .port()?;
            uart::send_command(port, Command::Go as u8)?;
            uart::send_address(port, CODE_ADDR)?;
            info!("Started user code at 0x{CODE_ADDR:08x}");
        }
        self.session
            .advance(SessionState::Done);
        self.session
            .close();
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn offset_u32(offset: usize) -> u32 {
    offset as u32
}

impl<P: Port> Flasher for UartFlasher<P> {
    fn connect(&mut self) -> Result<ChipInfo> {
        let result = self.do_connect();
        self.session
            .track(result)
    }

    fn info(&self) -> Option<&ChipInfo> {
        self.session
            .info()
    }

    fn state(&self) -> SessionState {
        self.session
            .state()
    }

    fn erase(&mut self, size: usize) -> Result<()> {
        let result = self.do_erase(size);
        self.session
            .track(result)
    }

    fn write(
        &mut self,
        image: &FlashImage,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let result = self.do_write(image, progress);
        self.session
            .track(result)
    }

    fn verify(
        &mut self,
        image: &FlashImage,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let result = self.do_verify(image, progress);
        self.session
            .track(result)
    }

    fn unlock(&mut self) -> Result<()> {
        let result = self.do_unlock();
        self.session
            .track(result)
    }

    fn lock(&mut self) -> Result<()> {
        let result = self.do_lock();
        self.session
            .track(result)
    }

    fn read_options(&mut self) -> Result<OptionBytes> {
        self.session
            .require_ready()?;
        self.current_options()
    }

    fn write_options(&mut self, options: &OptionBytes) -> Result<()> {
        let result = self.do_write_options(options);
        self.session
            .track(result)
    }

    fn read_uid(&mut self) -> Result<Vec<u8>> {
        let result = self.do_read_uid();
        self.session
            .track(result)
    }

    fn exit(&mut self) -> Result<()> {
        let result = self.do_exit();
        self.session
            .track(result)
    }

    fn close(&mut self) {
        self.session
            .close();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{option::ResetPinMode, port::mock::MockPort},
    };

    const G0_OPTIONS: [u8; 8] = [0xAA, 0xFE, 0xFF, 0xFF, 0x55, 0x01, 0x00, 0x00];
    const PUYA_OPTIONS: [u8; 16] = [
        0xAA, 0xBE, 0x55, 0x41, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
        0x00,
    ];

    fn get_reply(commands: &[u8]) -> Vec<u8> {
        let mut reply = vec![ACK, commands.len() as u8, 0x31];
        reply.extend_from_slice(commands);
        reply.push(ACK);
        reply
    }

    fn pid_reply(pid: u16) -> Vec<u8> {
        let mut reply = vec![ACK, 0x01];
        reply.extend_from_slice(&pid.to_be_bytes());
        reply.push(ACK);
        reply
    }

    /// Replies to one read-memory block.
    fn read_reply(data: &[u8]) -> Vec<u8> {
        let mut reply = vec![ACK, ACK, ACK];
        reply.extend_from_slice(data);
        reply
    }

    const ST_COMMANDS: &[u8] = &[0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92];

    fn stm32_port(pid: u16, commands: &[u8], options: &[u8]) -> MockPort {
        MockPort::new()
            .reply(&[ACK])
            .reply(&get_reply(commands))
            .reply(&pid_reply(pid))
            .reply(&read_reply(options))
    }

    fn puya_port(options: Option<&[u8]>) -> MockPort {
        let port = MockPort::new()
            .reply(&[ACK])
            .reply(&[NACK])
            .reply(&get_reply(ST_COMMANDS))
            .reply(&pid_reply(0x440));
        match options {
            Some(options) => port.reply(&read_reply(options)),
            None => port.reply(&[NACK]),
        }
    }

    fn connected_stm32(port: MockPort) -> UartFlasher<MockPort> {
        let mut flasher = UartFlasher::stm32(port);
        flasher
            .connect()
            .unwrap();
        flasher
    }

    #[test]
    fn test_connect_stm32() {
        let mut flasher = UartFlasher::stm32(stm32_port(0x466, ST_COMMANDS, &G0_OPTIONS));
        let info = flasher
            .connect()
            .unwrap();
        assert_eq!(info.name, "STM32G03x/04x");
        assert_eq!(info.id, 0x466);
        assert_eq!(info.bootloader, "3.1");
        assert!(!info.locked);
        let writes = flasher
            .port()
            .writes();
        assert_eq!(writes[0], vec![SYNC]);
        assert_eq!(writes[1], vec![0x00, 0xFF]);
        assert_eq!(writes[2], vec![0x02, 0xFD]);
        assert_eq!(writes[3], vec![0x11, 0xEE]);
        assert_eq!(writes[4], vec![0x1F, 0xFF, 0x78, 0x00, 0x98]);
        assert_eq!(writes[5], vec![0x07, 0xF8]);
        assert_eq!(
            flasher
                .read_options()
                .unwrap()
                .word(),
            0xFFFF_FEAA
        );
    }

    #[test]
    fn test_no_sync_means_no_device() {
        let mut flasher = UartFlasher::stm32(MockPort::new());
        assert!(matches!(flasher.connect(), Err(Error::DeviceNotFound)));
    }

    #[test]
    fn test_puya_sync_needs_nack() {
        let port = MockPort::new()
            .reply(&[ACK])
            .reply(&[ACK]);
        let mut flasher = UartFlasher::puya(port);
        assert!(matches!(flasher.connect(), Err(Error::DeviceNotFound)));
    }

    #[test]
    fn test_wrong_family_is_unsupported() {
        let port = MockPort::new()
            .reply(&[ACK])
            .reply(&get_reply(ST_COMMANDS))
            .reply(&pid_reply(0x440));
        let mut flasher = UartFlasher::stm32(port);
        assert!(matches!(
            flasher.connect(),
            Err(Error::UnsupportedDevice { id: 0x440 })
        ));
    }

    #[test]
    fn test_erase_variants() {
        let mut flasher = connected_stm32(stm32_port(0x466, ST_COMMANDS, &G0_OPTIONS).reply(&[ACK, ACK]));
        flasher
            .erase(100)
            .unwrap();
        let writes = flasher
            .port()
            .writes();
        assert_eq!(writes[writes.len() - 2], vec![0x44, 0xBB]);
        assert_eq!(writes[writes.len() - 1], uart::MASS_ERASE_EXTENDED.to_vec());

        let legacy_cmds = [0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x82, 0x92];
        let port = stm32_port(0x444, &legacy_cmds, &[0xAA, 0x55, 0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00])
            .reply(&[ACK, ACK]);
        let mut flasher = connected_stm32(port);
        flasher
            .erase(100)
            .unwrap();
        let writes = flasher
            .port()
            .writes();
        assert_eq!(writes[writes.len() - 2], vec![0x43, 0xBC]);
        assert_eq!(writes[writes.len() - 1], vec![0xFF, 0x00]);

        let port = stm32_port(0x457, ST_COMMANDS, &[0xAA, 0x00, 0x55, 0xFF, 0x70, 0x80, 0x8F, 0x7F])
            .reply(&[ACK, ACK]);
        let mut flasher = connected_stm32(port);
        flasher
            .erase(100)
            .unwrap();
        let payload = flasher
            .port()
            .writes()
            .last()
            .unwrap()
            .clone();
        assert_eq!(&payload[..4], &[0x00, 0x7F, 0x00, 0x00]);
        assert_eq!(payload.len(), 2 + 128 * 2 + 1);
    }

    #[test]
    fn test_erase_nack() {
        let mut flasher =
            connected_stm32(stm32_port(0x466, ST_COMMANDS, &G0_OPTIONS).reply(&[ACK, NACK]));
        assert!(matches!(
            flasher.erase(100),
            Err(Error::EraseFailed { status: NACK })
        ));
    }

    #[test]
    fn test_write_and_verify() {
        let image = FlashImage::from_bytes(
            (0..300u32)
                .map(|i| i as u8)
                .collect::<Vec<_>>(),
        );
        let padded = image.padded(8);
        let port = stm32_port(0x466, ST_COMMANDS, &G0_OPTIONS)
            .reply_n(&[ACK, ACK, ACK], 2)
            .reply(&read_reply(&image.as_bytes()[..256]))
            .reply(&read_reply(&image.as_bytes()[256..]));
        let mut flasher = connected_stm32(port);
        let mut progress = Vec::new();
        flasher
            .write(&image, &mut |done, total| progress.push((done, total)))
            .unwrap();
        assert_eq!(progress, vec![(256, 304), (304, 304)]);
        flasher
            .verify(&image, &mut |_, _| {})
            .unwrap();
        assert_eq!(flasher.state(), SessionState::Verified);

        let writes = flasher
            .port()
            .writes();
        // cmd, address, block for each of the two write blocks
        let first_block = &writes[8];
        assert_eq!(first_block[0], 0xFF);
        assert_eq!(&first_block[1..257], &padded[..256]);
        assert_eq!(writes[9], vec![0x31, 0xCE]);
        assert_eq!(writes[10], vec![0x08, 0x00, 0x01, 0x00, 0x09]);
        assert_eq!(writes[11][0], 47);
        assert_eq!(writes[11].len(), 48 + 2);
    }

    #[test]
    fn test_verify_reports_first_mismatch() {
        let image = FlashImage::from_bytes(vec![0x11; 16]);
        let mut flash = vec![0x11; 16];
        flash[9] = 0x10;
        let port = stm32_port(0x466, ST_COMMANDS, &G0_OPTIONS).reply(&read_reply(&flash));
        let mut flasher = connected_stm32(port);
        assert!(matches!(
            flasher.verify(&image, &mut |_, _| {}),
            Err(Error::VerificationFailed { offset: 9 })
        ));
    }

    #[test]
    fn test_write_nack_reports_offset() {
        let image = FlashImage::from_bytes(vec![0x22; 512]);
        let port = stm32_port(0x466, ST_COMMANDS, &G0_OPTIONS)
            .reply(&[ACK, ACK, ACK])
            .reply(&[ACK, ACK, NACK]);
        let mut flasher = connected_stm32(port);
        assert!(matches!(
            flasher.write(&image, &mut |_, _| {}),
            Err(Error::WriteFailed {
                offset: 256,
                status: NACK
            })
        ));
    }

    #[test]
    fn test_locked_chip_refuses_and_unlocks() {
        let port = puya_port(None);
        let mut flasher = UartFlasher::puya(port);
        let info = flasher
            .connect()
            .unwrap();
        assert!(info.locked);
        assert!(matches!(flasher.erase(10), Err(Error::LockedChip)));

        let port = puya_port(None)
            .reply(&[ACK, ACK])
            .reply(&[ACK])
            .reply(&read_reply(&PUYA_OPTIONS));
        let mut flasher = UartFlasher::puya(port);
        flasher
            .connect()
            .unwrap();
        flasher
            .unlock()
            .unwrap();
        assert!(
            !flasher
                .info()
                .unwrap()
                .locked
        );
        assert_eq!(flasher.state(), SessionState::Unlocked);
        let writes = flasher
            .port()
            .writes();
        assert!(writes.contains(&vec![0x92, 0x6D]));
        assert!(writes.contains(&vec![SYNC, 0x80]));
    }

    #[test]
    fn test_unlock_when_open_is_noop() {
        let mut flasher = UartFlasher::puya(puya_port(Some(&PUYA_OPTIONS)));
        flasher
            .connect()
            .unwrap();
        let before = flasher
            .port()
            .writes()
            .len();
        flasher
            .unlock()
            .unwrap();
        assert_eq!(
            flasher
                .port()
                .writes()
                .len(),
            before
        );
    }

    #[test]
    fn test_lock_when_locked_is_noop() {
        let mut flasher = UartFlasher::puya(puya_port(None));
        flasher
            .connect()
            .unwrap();
        let before = flasher
            .port()
            .writes()
            .len();
        flasher
            .lock()
            .unwrap();
        assert_eq!(
            flasher
                .port()
                .writes()
                .len(),
            before
        );
        assert!(
            flasher
                .info()
                .unwrap()
                .locked
        );
        assert_eq!(flasher.state(), SessionState::Ready);
    }

    #[test]
    fn test_puya_lock_writes_option_block_and_skips_go() {
        let port = puya_port(Some(&PUYA_OPTIONS)).reply(&[ACK, ACK, ACK]);
        let mut flasher = UartFlasher::puya(port);
        flasher
            .connect()
            .unwrap();
        flasher
            .lock()
            .unwrap();
        let writes = flasher
            .port()
            .writes()
            .to_vec();
        let block = writes
            .last()
            .unwrap();
        assert_eq!(block[0], 15);
        assert_eq!(block[1], 0x55);
        assert_eq!(block[3], 0xAA);
        assert_eq!(writes[writes.len() - 2], vec![0x1F, 0xFF, 0x0E, 0x80, 0x6E]);

        let count = writes.len();
        flasher
            .exit()
            .unwrap();
        assert_eq!(
            flasher
                .port()
                .writes()
                .len(),
            count
        );
        assert!(flasher.port().is_closed());
    }

    #[test]
    fn test_option_edit_round_trip_through_chip() {
        let port = puya_port(Some(&PUYA_OPTIONS)).reply(&[ACK, ACK, ACK]);
        let mut flasher = UartFlasher::puya(port);
        flasher
            .connect()
            .unwrap();
        let mut options = flasher
            .read_options()
            .unwrap();
        options
            .set_reset_pin(ResetPinMode::Gpio)
            .unwrap();
        flasher
            .write_options(&options)
            .unwrap();
        assert_eq!(
            flasher
                .read_options()
                .unwrap(),
            options
        );

        let wrong = OptionBytes::new(OptionLayout::Stm32(crate::option::Complement::UpperWord), G0_OPTIONS.to_vec(), &[]);
        assert!(matches!(
            flasher.write_options(&wrong),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_stm32_lock_and_run() {
        let port = stm32_port(0x466, ST_COMMANDS, &G0_OPTIONS).reply(&[ACK, ACK]);
        let mut flasher = connected_stm32(port);
        flasher
            .lock()
            .unwrap();
        assert_eq!(
            flasher
                .port()
                .writes()
                .last()
                .unwrap(),
            &vec![0x82, 0x7D]
        );
        flasher
            .exit()
            .unwrap();
        assert_eq!(flasher.state(), SessionState::Closed);

        let port = stm32_port(0x466, ST_COMMANDS, &G0_OPTIONS).reply(&[ACK, ACK]);
        let mut flasher = connected_stm32(port);
        flasher
            .exit()
            .unwrap();
        let writes = flasher
            .port()
            .writes();
        assert_eq!(writes[writes.len() - 2], vec![0x21, 0xDE]);
        assert_eq!(writes[writes.len() - 1], vec![0x08, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn test_puya_uid() {
        let uid: Vec<u8> = (0..128u8).collect();
        let port = puya_port(Some(&PUYA_OPTIONS)).reply(&read_reply(&uid));
        let mut flasher = UartFlasher::puya(port);
        flasher
            .connect()
            .unwrap();
        assert_eq!(
            flasher
                .read_uid()
                .unwrap(),
            uid
        );
        let writes = flasher
            .port()
            .writes();
        assert_eq!(writes[writes.len() - 2], vec![0x1F, 0xFF, 0x0E, 0x00, 0xEE]);
        assert_eq!(writes[writes.len() - 1], vec![0x7F, 0x80]);
    }
}
