//! STC8 flasher implementation.
//!
//! The UART bootloader only listens right after power-up: the host keeps
//! sending sync bytes at 2400 baud until the chip answers with its info
//! frame. Oscillator calibration happens at that rate, then both sides
//! switch to the transfer baud rate for erase and programming.
//!
//! The USB-HID bootloader uses the same payloads inside zero-padded
//! reports, has no baud rate to negotiate and trims from a preset table.

use {
    super::{CALIBRATION_BAUD, PAGE_SIZE, REPORT_SIZE, TRANSFER_BAUD, devices::registry, trim},
    crate::{
        error::{Error, Result},
        image::{FlashImage, chunks},
        option::{OptionBytes, OptionLayout},
        port::Port,
        protocol::stc,
        target::{
            chip::{ChipInfo, Flasher, ProtocolVariant, SessionState, TrimResult},
            session::Session,
        },
    },
    log::{debug, info, warn},
    std::{
        thread,
        time::{Duration, Instant},
    },
};

/// Byte sent until the chip answers after power-up.
const SYNC: u8 = 0x7F;
/// Byte sent while the chip measures its oscillator.
const TRIM_PULSE: u8 = 0x66;
/// Gap between sync and pulse bytes.
const PULSE_INTERVAL: Duration = Duration::from_millis(10);
/// How long to wait for a power cycle (1000 sync attempts).
const CONNECT_ATTEMPTS: usize = 1000;
/// How long a trim measurement may take.
const PULSE_BUDGET: Duration = Duration::from_secs(10);

const INFO_CODE: u8 = 0x50;
const BAUD_SET: u8 = 0x01;
const ERASE: u8 = 0x03;
const OPTIONS: u8 = 0x04;
const BAUD_CHECK: u8 = 0x05;
const WRITE_UART: u8 = 0x22;
const WRITE_USB: u8 = 0x32;
const WRITE_NEXT: u8 = 0x02;
const EXIT: u8 = 0xFF;
/// Guard bytes confirming destructive commands.
const GUARD: [u8; 2] = [0x5A, 0xA5];

const OPTIONS_HEAD: [u8; 24] = [
    0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0xFF,
];
const OPTIONS_TAIL_UART: [u8; 9] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xBF, 0xBF, 0xF7, 0xFF];
const OPTIONS_TAIL_USB: [u8; 9] = [0xFF, 0xFF, 0xFF, 0xFF, 0x3E, 0xBF, 0xAF, 0xF7, 0xFE];
/// Length of a complete option block built from a trim result.
const OPTION_BLOCK_LEN: usize = OPTIONS_HEAD.len() + 4 + 3 + OPTIONS_TAIL_UART.len();

/// Fields of the info frame.
#[derive(Debug, Clone)]
struct InfoFrame {
    chip_id: u32,
    version: u8,
    version_str: String,
    /// Raw ISP clock count; multiply by the baud rate for Hz.
    isp_count: u16,
    osc_frequency: u32,
    options: Vec<u8>,
}

impl InfoFrame {
    fn parse(reply: &[u8], min_len: usize) -> Result<Self> {
        if reply.len() < min_len.max(23) || reply[0] != INFO_CODE {
            return Err(Error::Protocol(format!(
                "invalid info frame ({} bytes, code 0x{:02x})",
                reply.len(),
                reply.first().copied().unwrap_or_default()
            )));
        }
        let mut options = reply[9..12].to_vec();
        options.extend_from_slice(&reply[15..17]);
        Ok(Self {
            chip_id: u32::from(u16::from_be_bytes([reply[20], reply[21]])),
            version: reply[17],
            version_str: format!(
                "{}.{}.{}{}",
                reply[17] >> 4,
                reply[17] & 0x0F,
                reply[22] & 0x0F,
                char::from(reply[18])
            ),
            isp_count: u16::from_be_bytes([reply[13], reply[14]]),
            osc_frequency: u32::from_be_bytes([reply[1], reply[2], reply[3], reply[4]]),
            options,
        })
    }
}

/// Flasher for STC8 bootloaders.
pub struct StcFlasher<P: Port> {
    session: Session<P>,
    variant: ProtocolVariant,
    transfer_baud: u32,
    frame: Option<InfoFrame>,
    trim: Option<TrimResult>,
    baud_switched: bool,
}

impl<P: Port> StcFlasher<P> {
    fn new(port: P, variant: ProtocolVariant) -> Self {
        Self {
            session: Session::new(port),
            variant,
            transfer_baud: TRANSFER_BAUD,
            frame: None,
            trim: None,
            baud_switched: false,
        }
    }

    /// Flasher for the UART bootloader.
    pub fn uart(port: P) -> Self {
        Self::new(port, ProtocolVariant::StcUart)
    }

    /// Flasher for the USB-HID bootloader.
    pub fn usb(port: P) -> Self {
        Self::new(port, ProtocolVariant::StcUsb)
    }

    /// Baud rate used after calibration.
    #[must_use]
    pub fn with_transfer_baud(mut self, baud: u32) -> Self {
        self.transfer_baud = baud;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.session
            .port_ref()
    }

    fn is_usb(&self) -> bool {
        self.variant == ProtocolVariant::StcUsb
    }

    fn transmit(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = stc::encode(payload);
        if self.is_usb() {
            frame.resize(frame.len().next_multiple_of(REPORT_SIZE), 0x00);
        }
        self.session
            .port()?
            .write_all_bytes(&frame)
    }

    fn receive(&mut self, what: &str) -> Result<Vec<u8>> {
        let usb = self.is_usb();
        let port = self
            .session
            .port()?;
        if usb {
            stc::decode(&port.read_packet(REPORT_SIZE)?)
        } else {
            stc::expect_frame(port, what)
        }
    }

    /// Send a command and require the reply to start with `code`.
    fn exchange(&mut self, payload: &[u8], code: u8, what: &str) -> Result<Vec<u8>> {
        self.transmit(payload)?;
        let reply = self.receive(what)?;
        match reply.first() {
            Some(&c) if c == code => Ok(reply),
            other => Err(Error::Protocol(format!(
                "{what}: unexpected reply code {other:02x?}"
            ))),
        }
    }

    fn guarded(command: u8) -> [u8; 5] {
        [command, 0x00, 0x00, GUARD[0], GUARD[1]]
    }

    fn frame(&self) -> Result<&InfoFrame> {
        self.frame
            .as_ref()
            .ok_or_else(|| Error::Protocol("not connected".into()))
    }

    fn wait_for_power_cycle(&mut self) -> Result<Vec<u8>> {
        let port = self
            .session
            .port()?;
        port.set_baud_rate(CALIBRATION_BAUD)?;
        port.clear_buffers()?;
        info!("Waiting for power cycle on {}", port.name());
        for _ in 0..CONNECT_ATTEMPTS {
            crate::check_interrupted()?;
            port.write_all_bytes(&[SYNC])?;
            if let Some(reply) = stc::read_frame(port)? {
                return Ok(reply);
            }
        }
        Err(Error::DeviceNotFound)
    }

    fn do_connect(&mut self) -> Result<ChipInfo> {
        let frame = if self.is_usb() {
            let reply = self.exchange(&[0x00], INFO_CODE, "info")?;
            let frame = InfoFrame::parse(&reply, 0)?;
            self.transmit(&[BAUD_SET, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80])?;
            self.receive("init")?;
            self.transmit(&Self::guarded(BAUD_CHECK))?;
            self.receive("init check")?;
            frame
        } else {
            let reply = self.wait_for_power_cycle()?;
            InfoFrame::parse(&reply, 42)?
        };

        let device = *registry().lookup(frame.chip_id)?;
        let osc = (frame.osc_frequency != u32::MAX).then_some(frame.osc_frequency);
        match osc {
            Some(hz) => info!("Found {} v{} @ {hz} Hz", device.name, frame.version_str),
            None => info!("Found {} v{} (untrimmed)", device.name, frame.version_str),
        }
        let info = ChipInfo {
            name: device
                .name
                .to_string(),
            id: frame.chip_id,
            bootloader: frame
                .version_str
                .clone(),
            variant: self.variant,
            code_flash_size: device.code_flash_size,
            data_flash_size: device.data_flash_size,
            uid: None,
            locked: false,
            osc_frequency: osc,
        };
        self.frame = Some(frame);
        self.session
            .identify(device, info.clone());
        self.session
            .advance(SessionState::Ready);
        Ok(info)
    }

    /// Switch the UART to the transfer baud rate once.
    fn ensure_transfer_baud(&mut self) -> Result<()> {
        if self.is_usb() || self.baud_switched {
            return Ok(());
        }
        let frame = self.frame()?;
        let isp_clock = f64::from(frame.isp_count) * f64::from(CALIBRATION_BAUD);
        let new_version = frame.version >= 0x72;
        let count = (65536.0 - isp_clock / (4.0 * f64::from(self.transfer_baud))).round_ties_even();
        if !(0.0..65536.0).contains(&count) {
            return Err(Error::Config(format!(
                "baud rate {} cannot be derived from the ISP clock",
                self.transfer_baud
            )));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let count = (count as u16).to_be_bytes();
        #[allow(clippy::cast_possible_truncation)]
        let fosc_low = frame.osc_frequency as u8;

        debug!("Switching to {} baud", self.transfer_baud);
        self.exchange(
            &[BAUD_SET, fosc_low, 0x40, count[0], count[1], 0x00, 0x00, 0x97],
            BAUD_SET,
            "set baud rate",
        )?;
        let baud = self.transfer_baud;
        self.session
            .port()?
            .set_baud_rate(baud)?;
        thread::sleep(PULSE_INTERVAL);
        if new_version {
            self.exchange(&Self::guarded(BAUD_CHECK), BAUD_CHECK, "check baud rate")?;
        } else {
            self.exchange(&[BAUD_CHECK], BAUD_CHECK, "check baud rate")?;
        }
        self.baud_switched = true;
        Ok(())
    }

    /// Send pulse bytes until the chip starts replying.
    fn pulse(&mut self) -> Result<()> {
        let port = self
            .session
            .port()?;
        let deadline = Instant::now() + PULSE_BUDGET;
        while port.bytes_to_read()? == 0 {
            crate::check_interrupted()?;
            if Instant::now() >= deadline {
                return Err(Error::Timeout("no reply to oscillator measurement".into()));
            }
            port.write_all_bytes(&[TRIM_PULSE])?;
            thread::sleep(PULSE_INTERVAL);
        }
        Ok(())
    }

    fn measure(&mut self, block: &[u8], what: &str) -> Result<Vec<u8>> {
        self.transmit(block)?;
        self.pulse()?;
        let reply = self.receive(what)?;
        if reply.first() != Some(&trim::TRIM_CODE) {
            return Err(Error::Protocol(format!("{what}: invalid reply")));
        }
        Ok(reply)
    }

    fn do_trim(&mut self, frequency: u32) -> Result<TrimResult> {
        self.session
            .require_ready()?;
        let result = if self.is_usb() {
            trim::usb_preset(frequency)?
        } else {
            trim::check_range(frequency)?;
            if self.baud_switched {
                return Err(Error::Protocol(
                    "oscillator calibration must run before erase or write".into(),
                ));
            }
            info!("Calibrating oscillator to {frequency} Hz");
            let coarse = self.measure(&trim::COARSE_BLOCK, "coarse trim")?;
            let estimate = trim::estimate(frequency, &coarse, CALIBRATION_BAUD)?;
            debug!("Trim estimate: {estimate:?}");
            let fine = self.measure(&trim::sweep_block(&estimate), "fine trim")?;
            trim::select(frequency, &estimate, &fine, CALIBRATION_BAUD)?
        };
        info!(
            "Oscillator trimmed to {} Hz (error {:.2}%)",
            result.frequency,
            100.0 * result.error
        );
        self.trim = Some(result);
        if let Some(info) = self
            .session
            .info_mut()
        {
            info.osc_frequency = Some(result.frequency);
        }
        Ok(result)
    }

    fn do_erase(&mut self, size: usize) -> Result<()> {
        self.session
            .require_ready()?;
        self.session
            .device()?
            .check_fits(size)?;
        self.ensure_transfer_baud()?;
        info!("Erasing chip");
        self.transmit(&Self::guarded(ERASE))?;
        let reply = self.receive("erase")?;
        match reply.first() {
            Some(&ERASE) => {},
            other => {
                return Err(Error::EraseFailed {
                    status: other
                        .copied()
                        .unwrap_or_default(),
                });
            },
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
        self.session
            .require_ready()?;
        let data = if self.is_usb() {
            image.padded(PAGE_SIZE)
        } else {
            image
                .as_bytes()
                .to_vec()
        };
        self.session
            .device()?
            .check_fits(data.len())?;
        self.ensure_transfer_baud()?;

        let total = data.len();
        let mut command = if self.is_usb() { WRITE_USB } else { WRITE_UART };
        for chunk in chunks(&data, PAGE_SIZE) {
            crate::check_interrupted()?;
            let address = u16::try_from(chunk.offset)
                .map_err(|_| Error::Protocol(format!("offset {} out of range", chunk.offset)))?;
            let mut block = Vec::with_capacity(5 + chunk.data.len());
            block.push(command);
            block.extend_from_slice(&address.to_be_bytes());
            block.extend_from_slice(&GUARD);
            block.extend_from_slice(chunk.data);
            self.transmit(&block)?;
            let reply = self.receive("write")?;
            if reply.first() != Some(&WRITE_NEXT) {
                return Err(Error::WriteFailed {
                    offset: u32::from(address),
                    status: reply
                        .first()
                        .copied()
                        .unwrap_or_default(),
                });
            }
            command = WRITE_NEXT;
            progress(chunk.offset + chunk.data.len(), total);
        }
        self.session
            .advance(SessionState::Written);
        Ok(())
    }

    /// Option block carrying the trim result.
    fn trimmed_options(&self, result: &TrimResult) -> OptionBytes {
        let tail = if self.is_usb() {
            &OPTIONS_TAIL_USB
        } else {
            &OPTIONS_TAIL_UART
        };
        let mut bytes = Vec::with_capacity(OPTION_BLOCK_LEN);
        bytes.extend_from_slice(&OPTIONS_HEAD);
        bytes.extend_from_slice(
            &result
                .frequency
                .to_be_bytes(),
        );
        bytes.extend_from_slice(&[result.trim, result.band, result.divisor]);
        bytes.extend_from_slice(tail);
        OptionBytes::new(OptionLayout::Stc, bytes, &[])
    }

    fn do_write_options(&mut self, options: &OptionBytes) -> Result<()> {
        self.session
            .require_ready()?;
        if options.layout() != OptionLayout::Stc
            || options
                .as_bytes()
                .len()
                != OPTION_BLOCK_LEN
        {
            return Err(Error::Unsupported(
                "STC option bytes can only be written from a trim result".into(),
            ));
        }
        self.ensure_transfer_baud()?;
        let mut block = Self::guarded(OPTIONS).to_vec();
        block.extend_from_slice(options.as_bytes());
        self.transmit(&block)?;
        let reply = self.receive("write options")?;
        if reply.first() != Some(&OPTIONS) {
            return Err(Error::OptionWriteFailed);
        }
        info!("Option bytes written");
        Ok(())
    }

    fn do_exit(&mut self) -> Result<()> {
        self.transmit(&[EXIT])?;
        self.session
            .advance(SessionState::Done);
        self.session
            .close();
        Ok(())
    }
}

impl<P: Port> Flasher for StcFlasher<P> {
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

    fn verify(&mut self, _: &FlashImage, _: &mut dyn FnMut(usize, usize)) -> Result<()> {
        Err(Error::Unsupported(
            "STC bootloaders cannot read flash back".into(),
        ))
    }

    fn supports_verify(&self) -> bool {
        false
    }

    fn unlock(&mut self) -> Result<()> {
        self.session
            .require_ready()?;
        debug!("STC parts have no read protection to remove");
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        Err(Error::Unsupported(
            "STC bootloaders cannot enable read protection".into(),
        ))
    }

    fn read_options(&mut self) -> Result<OptionBytes> {
        self.session
            .require_ready()?;
        if let Some(result) = self.trim {
            return Ok(self.trimmed_options(&result));
        }
        Ok(OptionBytes::new(
            OptionLayout::Stc,
            self.frame()?
                .options
                .clone(),
            &[],
        ))
    }

    fn write_options(&mut self, options: &OptionBytes) -> Result<()> {
        let result = self.do_write_options(options);
        self.session
            .track(result)
    }

    fn trim(&mut self, frequency: u32) -> Result<TrimResult> {
        let result = self.do_trim(frequency);
        if let Err(Error::TrimOutOfRange(e)) = &result {
            // A bad request leaves the session usable.
            warn!("{e}");
            return result;
        }
        self.session
            .track(result)
    }

    fn read_uid(&mut self) -> Result<Vec<u8>> {
        Err(Error::Unsupported(
            "STC bootloaders do not report a UID".into(),
        ))
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
