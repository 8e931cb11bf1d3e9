//! Ordered execution of a requested set of operations.
//!
//! The bootloaders only accept their commands in a fixed order (calibrate
//! before the baud switch, erase before programming, option bytes last
//! because writing them resets most parts). [`FlashPlan`] encodes that order
//! once for every family.

use {
    crate::{
        error::{Error, Result},
        image::FlashImage,
        option::OptionEdit,
        target::{ChipInfo, Flasher, ProtocolVariant, TrimResult},
    },
    log::{info, warn},
    std::fmt,
};

/// Step reported to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Programming the image.
    Write,
    /// Reading the image back.
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => write!(f, "Writing"),
            Self::Verify => write!(f, "Verifying"),
        }
    }
}

/// What a plan run did.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanReport {
    /// Identity from the handshake.
    pub info: ChipInfo,
    /// Calibration outcome, when a trim was requested.
    pub trim: Option<TrimResult>,
    /// The image was read back and matched.
    pub verified: bool,
    /// Option bytes were rewritten.
    pub options_written: bool,
}

/// Operations requested for one session.
#[derive(Debug, Clone, Default)]
pub struct FlashPlan {
    /// Erase even without an image.
    pub erase: bool,
    /// Image to program from the start of code flash.
    pub image: Option<FlashImage>,
    /// Read the image back after writing.
    pub verify: bool,
    /// Remove read protection first.
    pub unlock: bool,
    /// Enable read protection last.
    pub lock: bool,
    /// Option edits applied in order.
    pub option_edits: Vec<OptionEdit>,
    /// Oscillator frequency to calibrate to (STC).
    pub trim: Option<u32>,
    /// Start the firmware at the end instead of just disconnecting.
    pub run: bool,
}

impl FlashPlan {
    /// Empty plan that starts the firmware when done.
    pub fn new() -> Self {
        Self {
            run: true,
            ..Self::default()
        }
    }

    /// Program and verify `image`.
    #[must_use]
    pub fn with_image(mut self, image: FlashImage) -> Self {
        self.image = Some(image);
        self.verify = true;
        self
    }

    /// Request a full erase.
    #[must_use]
    pub fn with_erase(mut self, erase: bool) -> Self {
        self.erase = erase;
        self
    }

    /// Enable or skip read-back verification.
    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Request unlocking.
    #[must_use]
    pub fn with_unlock(mut self, unlock: bool) -> Self {
        self.unlock = unlock;
        self
    }

    /// Request locking.
    #[must_use]
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// Add an option edit.
    #[must_use]
    pub fn with_option(mut self, edit: OptionEdit) -> Self {
        self.option_edits
            .push(edit);
        self
    }

    /// Request oscillator calibration.
    #[must_use]
    pub fn with_trim(mut self, frequency: u32) -> Self {
        self.trim = Some(frequency);
        self
    }

    /// Start the firmware (or only disconnect) at the end.
    #[must_use]
    pub fn with_run(mut self, run: bool) -> Self {
        self.run = run;
        self
    }

    /// Nothing to do but enable read protection.
    fn is_lock_only(&self) -> bool {
        self.lock
            && self.image.is_none()
            && !self.erase
            && self.trim.is_none()
            && self
                .option_edits
                .is_empty()
    }

    fn needs_erase(&self) -> bool {
        self.erase || self.image.is_some() || self.trim.is_some()
    }

    /// Run the plan on an unconnected flasher.
    ///
    /// The flasher is closed before any error is returned.
    pub fn execute(
        &self,
        flasher: &mut dyn Flasher,
        progress: &mut dyn FnMut(Stage, usize, usize),
    ) -> Result<PlanReport> {
        let result = self.run_steps(flasher, progress);
        if result.is_err() {
            flasher.close();
        }
        result
    }

    fn run_steps(
        &self,
        flasher: &mut dyn Flasher,
        progress: &mut dyn FnMut(Stage, usize, usize),
    ) -> Result<PlanReport> {
        let info = flasher.connect()?;
        if info.locked && !self.unlock {
            if !self.is_lock_only() {
                return Err(Error::LockedChip);
            }
            // A protected bootloader refuses GO, so only disconnect.
            info!("Read protection already active");
            flasher.close();
            return Ok(PlanReport {
                info,
                trim: None,
                verified: false,
                options_written: false,
            });
        }
        if self.unlock {
            info!("Removing read protection");
            flasher.unlock()?;
        }

        let trim = match self.trim {
            Some(frequency) => Some(flasher.trim(frequency)?),
            None => None,
        };

        if self.needs_erase() {
            let size = self
                .image
                .as_ref()
                .map_or(info.code_flash_size, FlashImage::len);
            flasher.erase(size)?;
        }

        let mut verified = false;
        if let Some(image) = &self.image {
            info!("Writing {} bytes", image.len());
            flasher.write(image, &mut |done, total| progress(Stage::Write, done, total))?;
            if self.verify {
                if flasher.supports_verify() {
                    flasher.verify(image, &mut |done, total| {
                        progress(Stage::Verify, done, total);
                    })?;
                    verified = true;
                } else {
                    warn!("{} bootloaders cannot verify; skipped", info.variant);
                }
            }
        }

        let options_written = self.update_options(flasher, &info, trim.is_some())?;

        if self.lock {
            info!("Enabling read protection");
            flasher.lock()?;
        }

        if self.run {
            flasher.exit()?;
        } else {
            flasher.close();
        }

        Ok(PlanReport {
            info: flasher
                .info()
                .cloned()
                .unwrap_or(info),
            trim,
            verified,
            options_written,
        })
    }

    /// Read, edit and write back the option block when anything changes it.
    fn update_options(
        &self,
        flasher: &mut dyn Flasher,
        info: &ChipInfo,
        trimmed: bool,
    ) -> Result<bool> {
        let check_boot_pin = info.variant == ProtocolVariant::Stm32;
        if self
            .option_edits
            .is_empty()
            && !trimmed
            && !check_boot_pin
        {
            return Ok(false);
        }

        let mut options = flasher.read_options()?;
        let original = options.clone();
        for edit in &self.option_edits {
            options.apply(*edit)?;
        }
        if check_boot_pin && options.boot_pin_disabled() {
            info!("Enabling the BOOT0 pin");
            options.enable_boot_pin()?;
        }
        if options == original && !trimmed {
            return Ok(false);
        }
        info!("Writing option bytes: {options}");
        flasher.write_options(&options)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            option::{OptionBytes, OptionLayout, ResetPinMode},
            target::SessionState,
        },
    };

    /// Flasher double recording the calls it receives.
    struct Recorder {
        info: ChipInfo,
        options: OptionBytes,
        calls: Vec<String>,
        fail_on: Option<&'static str>,
        verify: bool,
        state: SessionState,
    }

    impl Recorder {
        fn new(variant: ProtocolVariant) -> Self {
            Self {
                info: ChipInfo {
                    name: "TEST".into(),
                    id: 0x466,
                    bootloader: "5.3".into(),
                    variant,
                    code_flash_size: 65536,
                    data_flash_size: 0,
                    uid: None,
                    locked: false,
                    osc_frequency: None,
                },
                options: OptionBytes::new(
                    OptionLayout::Puya,
                    vec![0xAA, 0xBE, 0x55, 0x41, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00],
                    &[],
                ),
                calls: Vec::new(),
                fail_on: None,
                verify: true,
                state: SessionState::Disconnected,
            }
        }

        fn call(&mut self, name: &'static str) -> Result<()> {
            self.calls
                .push(name.to_string());
            if self.fail_on == Some(name) {
                return Err(Error::Timeout(name.into()));
            }
            Ok(())
        }
    }

    impl Flasher for Recorder {
        fn connect(&mut self) -> Result<ChipInfo> {
            self.call("connect")?;
            Ok(self
                .info
                .clone())
        }

        fn info(&self) -> Option<&ChipInfo> {
            Some(&self.info)
        }

        fn state(&self) -> SessionState {
            self.state
        }

        fn erase(&mut self, size: usize) -> Result<()> {
            self.calls
                .push(format!("erase {size}"));
            Ok(())
        }

        fn write(
            &mut self,
            image: &FlashImage,
            progress: &mut dyn FnMut(usize, usize),
        ) -> Result<()> {
            self.call("write")?;
            progress(image.len(), image.len());
            Ok(())
        }

        fn verify(
            &mut self,
            image: &FlashImage,
            progress: &mut dyn FnMut(usize, usize),
        ) -> Result<()> {
            self.call("verify")?;
            progress(image.len(), image.len());
            Ok(())
        }

        fn supports_verify(&self) -> bool {
            self.verify
        }

        fn unlock(&mut self) -> Result<()> {
            self.call("unlock")
        }

        fn lock(&mut self) -> Result<()> {
            self.call("lock")
        }

        fn read_options(&mut self) -> Result<OptionBytes> {
            self.call("read_options")?;
            Ok(self
                .options
                .clone())
        }

        fn write_options(&mut self, options: &OptionBytes) -> Result<()> {
            self.call("write_options")?;
            self.options = options.clone();
            Ok(())
        }

        fn trim(&mut self, frequency: u32) -> Result<TrimResult> {
            self.call("trim")?;
            Ok(TrimResult {
                divisor: 1,
                trim: 128,
                band: 1,
                frequency,
                error: 0.0,
            })
        }

        fn read_uid(&mut self) -> Result<Vec<u8>> {
            Err(Error::Unsupported("uid".into()))
        }

        fn exit(&mut self) -> Result<()> {
            self.call("exit")?;
            self.state = SessionState::Closed;
            Ok(())
        }

        fn close(&mut self) {
            self.calls
                .push("close".into());
            self.state = SessionState::Closed;
        }
    }

    #[test]
    fn test_flash_order() {
        let mut flasher = Recorder::new(ProtocolVariant::Puya);
        let plan = FlashPlan::new().with_image(FlashImage::from_bytes(vec![0u8; 300]));
        let mut stages = Vec::new();
        let report = plan
            .execute(&mut flasher, &mut |stage, _, _| stages.push(stage))
            .unwrap();
        assert!(report.verified);
        assert!(!report.options_written);
        assert_eq!(
            flasher.calls,
            ["connect", "erase 300", "write", "verify", "exit"]
        );
        assert_eq!(stages, [Stage::Write, Stage::Verify]);
    }

    #[test]
    fn test_locked_chip_needs_unlock() {
        let mut flasher = Recorder::new(ProtocolVariant::Puya);
        flasher
            .info
            .locked = true;
        let plan = FlashPlan::new().with_erase(true);
        assert!(matches!(
            plan.execute(&mut flasher, &mut |_, _, _| {}),
            Err(Error::LockedChip)
        ));
        assert_eq!(flasher.calls, ["connect", "close"]);

        let mut flasher = Recorder::new(ProtocolVariant::Puya);
        flasher
            .info
            .locked = true;
        FlashPlan::new()
            .with_unlock(true)
            .execute(&mut flasher, &mut |_, _, _| {})
            .unwrap();
        assert_eq!(flasher.calls, ["connect", "unlock", "exit"]);
    }

    #[test]
    fn test_lock_on_locked_chip_is_noop() {
        for run in [false, true] {
            let mut flasher = Recorder::new(ProtocolVariant::Puya);
            flasher
                .info
                .locked = true;
            let report = FlashPlan::new()
                .with_lock(true)
                .with_run(run)
                .execute(&mut flasher, &mut |_, _, _| {})
                .unwrap();
            assert!(report.info.locked);
            assert!(!report.options_written);
            assert_eq!(flasher.calls, ["connect", "close"]);
        }

        let mut flasher = Recorder::new(ProtocolVariant::Stm32);
        flasher
            .info
            .locked = true;
        let plan = FlashPlan::new()
            .with_lock(true)
            .with_erase(true);
        assert!(matches!(
            plan.execute(&mut flasher, &mut |_, _, _| {}),
            Err(Error::LockedChip)
        ));
    }

    #[test]
    fn test_erase_only_uses_flash_size() {
        let mut flasher = Recorder::new(ProtocolVariant::WchV2);
        FlashPlan::new()
            .with_erase(true)
            .with_run(false)
            .execute(&mut flasher, &mut |_, _, _| {})
            .unwrap();
        assert_eq!(flasher.calls, ["connect", "erase 65536", "close"]);
    }

    #[test]
    fn test_verify_skipped_when_unsupported() {
        let mut flasher = Recorder::new(ProtocolVariant::StcUart);
        flasher.verify = false;
        let report = FlashPlan::new()
            .with_image(FlashImage::from_bytes(vec![1u8; 16]))
            .execute(&mut flasher, &mut |_, _, _| {})
            .unwrap();
        assert!(!report.verified);
        assert!(
            !flasher
                .calls
                .contains(&"verify".to_string())
        );
    }

    #[test]
    fn test_trim_erases_and_writes_options() {
        let mut flasher = Recorder::new(ProtocolVariant::StcUart);
        let report = FlashPlan::new()
            .with_trim(24_000_000)
            .execute(&mut flasher, &mut |_, _, _| {})
            .unwrap();
        assert_eq!(
            report
                .trim
                .map(|t| t.frequency),
            Some(24_000_000)
        );
        assert!(report.options_written);
        assert_eq!(
            flasher.calls,
            [
                "connect",
                "trim",
                "erase 65536",
                "read_options",
                "write_options",
                "exit"
            ]
        );
    }

    #[test]
    fn test_option_edits_then_lock() {
        let mut flasher = Recorder::new(ProtocolVariant::Puya);
        let report = FlashPlan::new()
            .with_option(OptionEdit::ResetPin(ResetPinMode::Gpio))
            .with_lock(true)
            .execute(&mut flasher, &mut |_, _, _| {})
            .unwrap();
        assert!(report.options_written);
        assert_eq!(
            flasher.calls,
            ["connect", "read_options", "write_options", "lock", "exit"]
        );
    }

    #[test]
    fn test_unchanged_options_are_not_written() {
        let mut flasher = Recorder::new(ProtocolVariant::Stm32);
        flasher.options = OptionBytes::new(
            OptionLayout::Stm32(crate::option::Complement::UpperWord),
            vec![0xAA, 0xE1, 0xFF, 0xDE, 0x55, 0x1E, 0x00, 0x21],
            &[],
        );
        let report = FlashPlan::new()
            .with_run(false)
            .execute(&mut flasher, &mut |_, _, _| {})
            .unwrap();
        assert!(!report.options_written);
        assert_eq!(flasher.calls, ["connect", "read_options", "close"]);
    }

    #[test]
    fn test_boot_pin_enabled_on_stm32() {
        let mut flasher = Recorder::new(ProtocolVariant::Stm32);
        flasher.options = OptionBytes::new(
            OptionLayout::Stm32(crate::option::Complement::UpperWord),
            vec![0xAA, 0xE1, 0xFF, 0xFF, 0x55, 0x1E, 0x00, 0x00],
            &[],
        );
        let report = FlashPlan::new()
            .execute(&mut flasher, &mut |_, _, _| {})
            .unwrap();
        assert!(report.options_written);
        assert!(
            !flasher
                .options
                .boot_pin_disabled()
        );
    }

    #[test]
    fn test_failure_closes_flasher() {
        let mut flasher = Recorder::new(ProtocolVariant::WchV2);
        flasher.fail_on = Some("write");
        let result = FlashPlan::new()
            .with_image(FlashImage::from_bytes(vec![0u8; 8]))
            .execute(&mut flasher, &mut |_, _, _| {});
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(
            flasher
                .calls
                .last()
                .map(String::as_str),
            Some("close")
        );
        assert_eq!(flasher.state(), SessionState::Closed);
    }
}
