//! WCH flasher implementation.
//!
//! One engine serves all three bootloader generations:
//!
//! - **v2**: 6-byte detect reply, UID-derived XOR key, 56-byte chunks
//! - **v2 legacy** (early CH32V203): same frames, chip type folded into
//!   every eighth byte instead of a payload key
//! - **v1** (CH55x): 2-byte detect reply, plaintext 60-byte chunks
//!
//! Every command is answered by exactly one USB packet, except reboot which
//! is write-only.

use {
    super::{PACKET_SIZE, devices::registry},
    crate::{
        error::{Error, Result},
        image::{FlashImage, chunks},
        option::{OptionBytes, OptionLayout},
        port::Port,
        protocol::{
            XorKey,
            checksum::sum8,
            cipher::{KEY_LEN, fold_chip_type},
            wch::{self, CONFIG_LEN, ConfigReply, ProgramMode, WchFrame, legacy},
        },
        registry::Quirks,
        target::{
            chip::{ChipInfo, Flasher, ProtocolVariant, SessionState},
            session::Session,
        },
    },
    log::{debug, info, trace},
};

/// How payloads are scrambled after the handshake.
#[derive(Debug, Clone, Copy)]
enum Scramble {
    /// v1 sends plaintext.
    None,
    /// v2 XORs the padded image with the derived key.
    Key(XorKey),
    /// Legacy v2 folds the chip type into whole frames.
    Fold(u8),
}

/// Session data only the WCH engine needs.
#[derive(Debug, Clone)]
struct Identity {
    variant: ProtocolVariant,
    scramble: Scramble,
    config: Option<[u8; CONFIG_LEN]>,
    uid: Vec<u8>,
}

/// Flasher for WCH USB bootloaders.
///
/// Generic over the port type `P`; the CLI uses a bulk-endpoint `UsbPort`.
pub struct WchFlasher<P: Port> {
    session: Session<P>,
    legacy_key: bool,
    identity: Option<Identity>,
}

impl<P: Port> WchFlasher<P> {
    /// Create a flasher on an opened transport.
    pub fn new(port: P) -> Self {
        Self {
            session: Session::new(port),
            legacy_key: false,
            identity: None,
        }
    }

    /// Use the early CH32V203 key exchange.
    #[must_use]
    pub fn with_legacy_key(mut self, legacy_key: bool) -> Self {
        self.legacy_key = legacy_key;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.session
            .port_ref()
    }

    fn identity(&self) -> Result<&Identity> {
        self.identity
            .as_ref()
            .ok_or_else(|| Error::Protocol("not connected".into()))
    }

    /// Send one frame and return the reply packet.
    fn command(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        trace!("WCH >> {frame:02x?}");
        let port = self
            .session
            .port()?;
        port.write_all_bytes(frame)?;
        let reply = port.read_packet(PACKET_SIZE)?;
        trace!("WCH << {reply:02x?}");
        Ok(reply)
    }

    fn send_only(&mut self, frame: &[u8]) -> Result<()> {
        trace!("WCH >> {frame:02x?}");
        self.session
            .port()?
            .write_all_bytes(frame)
    }

    fn do_connect(&mut self) -> Result<ChipInfo> {
        info!("Detecting WCH bootloader on {}", self.port().name());
        self.session
            .port()?
            .clear_buffers()?;

        let detect = match self.command(&WchFrame::detect().build()) {
            Err(Error::Timeout(_)) => return Err(Error::DeviceNotFound),
            other => other?,
        };

        let (chip_type, family, v1_version) = match detect.len() {
            6 => (detect[4], detect[5], None),
            2 => {
                let ident = self.command(&wch::detect_v1())?;
                if ident.len() != 2 {
                    return Err(Error::Protocol(format!(
                        "v1 detect reply has {} bytes",
                        ident.len()
                    )));
                }
                let cfg = self.command(&wch::config_read_v1())?;
                if cfg.len() != 2 {
                    return Err(Error::ConfigReadFailed(format!(
                        "expected 2 bytes, got {}",
                        cfg.len()
                    )));
                }
                let version = format!("{}.{}", cfg[0] >> 4, cfg[0] & 0x0F);
                (ident[0], ident[1], Some(version))
            },
            n => {
                return Err(Error::Protocol(format!("detect reply has {n} bytes")));
            },
        };

        let id = (u32::from(family) << 8) | u32::from(chip_type);
        let device = *registry().lookup(id)?;
        debug!("WCH chip id 0x{id:04x}: {}", device.name);

        let (identity, bootloader) = match v1_version {
            Some(version) => (
                Identity {
                    variant: ProtocolVariant::WchV1,
                    scramble: Scramble::None,
                    config: None,
                    uid: Vec::new(),
                },
                version,
            ),
            None => {
                let uid_len = if device.has(Quirks::WIDE_UID) { 8 } else { 4 };
                let reply = self.command(&WchFrame::config_read().build())?;
                let config = ConfigReply::parse(&reply, uid_len)?;
                let scramble = self.exchange_key(&config.uid, chip_type)?;
                let variant = if self.legacy_key {
                    ProtocolVariant::WchV2Legacy
                } else {
                    ProtocolVariant::WchV2
                };
                (
                    Identity {
                        variant,
                        scramble,
                        config: Some(config.config),
                        uid: config.uid,
                    },
                    config.bootloader,
                )
            },
        };

        let locked = device.has(Quirks::NEEDS_OPTION_BYTE_UNLOCK_REMOVAL)
            && identity
                .config
                .is_some_and(|c| c[0] == 0xFF);
        let info = ChipInfo {
            name: device
                .name
                .to_string(),
            id,
            bootloader,
            variant: identity.variant,
            code_flash_size: device.code_flash_size,
            data_flash_size: device.data_flash_size,
            uid: (!identity
                .uid
                .is_empty())
            .then(|| {
                identity
                    .uid
                    .clone()
            }),
            locked,
            osc_frequency: None,
        };
        self.identity = Some(identity);
        self.session
            .identify(device, info.clone());

        if device.has(Quirks::NEEDS_CONFIG_FIXUP) {
            self.apply_config_fixup()?;
        }

        info!(
            "Found {} with bootloader v{} ({})",
            info.name, info.bootloader, info.variant
        );
        self.session
            .advance(SessionState::Ready);
        Ok(info)
    }

    /// Set up payload scrambling and check the bootloader agrees.
    fn exchange_key(&mut self, uid: &[u8], chip_type: u8) -> Result<Scramble> {
        if self.legacy_key {
            // The legacy bootloader gives no usable echo for this frame.
            let _ = self.command(&legacy::key_set(sum8(uid)))?;
            return Ok(Scramble::Fold(chip_type));
        }
        let key = XorKey::derive(uid, chip_type);
        let reply = self.command(&WchFrame::key_set().build())?;
        let actual = wch::status_v2(&reply)?;
        if actual != key.checksum() {
            return Err(Error::KeyRejected {
                expected: key.checksum(),
                actual,
            });
        }
        debug!("Encryption key accepted");
        Ok(Scramble::Key(key))
    }

    /// CH579 needs bit 7 of config byte 8 cleared before flashing.
    fn apply_config_fixup(&mut self) -> Result<()> {
        let Some(mut config) = self
            .identity()?
            .config
        else {
            return Ok(());
        };
        config[8] &= 0x7F;
        debug!("Applying CH579 config fixup");
        self.write_config(config)
    }

    fn write_config(&mut self, config: [u8; CONFIG_LEN]) -> Result<()> {
        let reply = self.command(&WchFrame::config_write(&config).build())?;
        let status = wch::status_v2(&reply)?;
        if status != 0 {
            debug!("Config write rejected with status 0x{status:02x}");
            return Err(Error::OptionWriteFailed);
        }
        if let Some(identity) = self
            .identity
            .as_mut()
        {
            identity.config = Some(config);
        }
        Ok(())
    }

    fn do_erase(&mut self, size: usize) -> Result<()> {
        self.session
            .require_ready()?;
        let device = *self
            .session
            .device()?;
        device.check_fits(size)?;

        match self
            .identity()?
            .variant
        {
            ProtocolVariant::WchV1 => {
                // The start command has no meaningful status.
                let _ = self.command(&wch::erase_start_v1())?;
                for page in 0..device.code_flash_size / wch::ERASE_UNIT {
                    crate::check_interrupted()?;
                    let reply = self.command(&wch::erase_page_v1(page))?;
                    let status = wch::status_v1(&reply)?;
                    if status != 0 {
                        return Err(Error::EraseFailed { status });
                    }
                }
            },
            variant => {
                let units = u16::try_from(wch::erase_units(size))
                    .map_err(|_| Error::Protocol(format!("cannot erase {size} bytes")))?;
                info!("Erasing {units} KiB");
                let frame = if variant == ProtocolVariant::WchV2Legacy {
                    legacy::erase(units)
                } else {
                    WchFrame::erase(units).build()
                };
                let reply = self.command(&frame)?;
                let status = wch::status_v2(&reply)?;
                if status != 0 {
                    return Err(Error::EraseFailed { status });
                }
            },
        }
        self.session
            .advance(SessionState::Erased);
        Ok(())
    }

    /// Stream the image in program or verify mode.
    fn program(
        &mut self,
        image: &FlashImage,
        mode: ProgramMode,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        self.session
            .require_ready()?;
        let device = *self
            .session
            .device()?;
        device.check_fits(image.len())?;
        let Identity {
            variant, scramble, ..
        } = self
            .identity()?
            .clone();

        let data = match scramble {
            Scramble::None => image
                .as_bytes()
                .to_vec(),
            Scramble::Key(key) => {
                let mut data = image.padded(KEY_LEN);
                key.apply(&mut data);
                data
            },
            Scramble::Fold(_) => image.padded(KEY_LEN),
        };
        let total = data.len();

        for chunk in chunks(&data, variant.chunk_size()) {
            crate::check_interrupted()?;
            let status = if variant == ProtocolVariant::WchV1 {
                let reply = self.command(&wch::program_v1(mode, chunk.offset, chunk.data))?;
                let status = wch::status_v1(&reply)?;
                (status != 0).then_some(status)
            } else {
                let mut frame = WchFrame::program(
                    mode,
                    offset_u32(chunk.offset),
                    chunk.remaining,
                    chunk.data,
                )
                .build();
                if let Scramble::Fold(chip_type) = scramble {
                    fold_chip_type(&mut frame, chip_type);
                }
                let reply = self.command(&frame)?;
                let status = wch::status_v2(&reply)?;
                (!wch::is_accepted(status)).then_some(status)
            };
            if let Some(status) = status {
                let offset = offset_u32(chunk.offset);
                return Err(match mode {
                    ProgramMode::Write => Error::WriteFailed { offset, status },
                    ProgramMode::Verify => Error::VerificationFailed { offset },
                });
            }
            progress(chunk.offset + chunk.data.len(), total);
        }

        if mode == ProgramMode::Write
            && variant != ProtocolVariant::WchV1
            && device.has(Quirks::NEEDS_TRAILING_EMPTY_WRITE)
        {
            let frame = WchFrame::program(mode, offset_u32(total), 0, &[]).build();
            if let Err(e) = self.command(&frame) {
                debug!("Trailing empty write not answered: {e}");
            }
        }
        Ok(())
    }

    fn current_options(&self) -> Result<OptionBytes> {
        let config = self
            .identity()?
            .config
            .ok_or_else(|| {
                Error::Unsupported("bootloader v1 has no config block".into())
            })?;
        Ok(OptionBytes::new(
            OptionLayout::WchConfig,
            config.to_vec(),
            &[],
        ))
    }

    fn do_unlock(&mut self) -> Result<()> {
        self.session
            .require_ready()?;
        let device = *self
            .session
            .device()?;
        if !device.has(Quirks::NEEDS_OPTION_BYTE_UNLOCK_REMOVAL)
            || self
                .identity()?
                .config
                .is_none()
        {
            debug!("{} has no removable read protection", device.name);
            return Ok(());
        }
        let mut options = self.current_options()?;
        if !options.is_read_protected() {
            debug!("Chip is already unlocked");
            return Ok(());
        }
        options.set_read_protection(false)?;
        self.do_write_options(&options)?;
        if let Some(info) = self
            .session
            .info_mut()
        {
            info.locked = false;
        }
        self.session
            .advance(SessionState::Unlocked);
        info!("Read protection removed");
        Ok(())
    }

    fn do_write_options(&mut self, options: &OptionBytes) -> Result<()> {
        self.session
            .require_ready()?;
        let config: [u8; CONFIG_LEN] = match options.layout() {
            OptionLayout::WchConfig => options
                .as_bytes()
                .try_into()
                .map_err(|_| Error::Config("WCH config block must be 12 bytes".into()))?,
            other => {
                return Err(Error::Config(format!(
                    "{other:?} option bytes cannot be written to a WCH chip"
                )));
            },
        };
        if self
            .identity()?
            .config
            .is_none()
        {
            return Err(Error::Unsupported(
                "bootloader v1 has no config block".into(),
            ));
        }
        self.write_config(config)
    }

    fn do_exit(&mut self) -> Result<()> {
        let frame = match self
            .identity()?
            .variant
        {
            ProtocolVariant::WchV1 => wch::reboot_v1(),
            _ => WchFrame::reboot().build(),
        };
        self.send_only(&frame)?;
        info!("Rebooting into user code");
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

impl<P: Port> Flasher for WchFlasher<P> {
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
        let result = self.program(image, ProgramMode::Write, progress);
        if result.is_ok() {
            self.session
                .advance(SessionState::Written);
        }
        self.session
            .track(result)
    }

    fn verify(
        &mut self,
        image: &FlashImage,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let result = self.program(image, ProgramMode::Verify, progress);
        if result.is_ok() {
            self.session
                .advance(SessionState::Verified);
        }
        self.session
            .track(result)
    }

    fn unlock(&mut self) -> Result<()> {
        let result = self.do_unlock();
        self.session
            .track(result)
    }

    fn lock(&mut self) -> Result<()> {
        Err(Error::Unsupported(
            "WCH bootloaders cannot enable read protection".into(),
        ))
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
        self.session
            .require_ready()?;
        let uid = &self
            .identity()?
            .uid;
        if uid.is_empty() {
            return Err(Error::Unsupported(
                "bootloader v1 does not report a UID".into(),
            ));
        }
        Ok(uid.clone())
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
