//! # ispflash
//!
//! A library for flashing microcontrollers through their factory ISP
//! bootloaders.
//!
//! The crate speaks the bootloader protocols directly:
//!
//! - WCH CH5xx/CH32 over USB (bootloader v1, v2 and the early CH32V203 key)
//! - PUYA PY32F0xx and STM32 C0/F0/G0/L0 over UART
//! - STC8G/STC8H over UART (with oscillator calibration) and USB-HID
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `usb` (default): USB bootloaders via `rusb`
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use ispflash::{ConnectOptions, FlashImage, FlashPlan, ProtocolFamily};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FlashImage::from_file("firmware.bin")?;
//!     let options = ConnectOptions::new().with_port("/dev/ttyUSB0");
//!     let mut flasher = ProtocolFamily::Puya.create_flasher(&options)?;
//!
//!     let report = FlashPlan::new()
//!         .with_image(image)
//!         .execute(flasher.as_mut(), &mut |stage, done, total| {
//!             println!("{stage}: {done}/{total}");
//!         })?;
//!     println!("Flashed {}", report.info.name);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::{
    io,
    sync::{Arc, OnceLock},
};

pub mod device;
pub mod error;
pub mod image;
pub mod option;
pub mod plan;
pub mod port;
pub mod protocol;
pub mod registry;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

/// Fail with an `Interrupted` I/O error once interruption was requested.
pub(crate) fn check_interrupted() -> Result<()> {
    if is_interrupted_requested() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::Interrupted,
            "operation interrupted",
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
#[cfg(feature = "usb")]
pub use port::{UsbConfig, UsbPort};
pub use {
    device::{DetectedPort, DeviceKind, TransportKind, auto_detect_port, detect_ports},
    error::{Error, Result},
    image::FlashImage,
    option::{OptionBytes, OptionEdit, OptionLayout, ResetPinMode},
    plan::{FlashPlan, PlanReport, Stage},
    port::{Port, PortEnumerator, PortInfo, SerialConfig, UsbFilter},
    registry::{DeviceDescriptor, Quirks, Registry},
    target::{
        ChipInfo, ConnectOptions, Flasher, ProtocolFamily, ProtocolVariant, SessionState,
        TrimResult,
    },
};
