//! Protocol engines, one per bootloader family.
//!
//! Each engine implements [`Flasher`]. Pick one with [`ProtocolFamily`],
//! which also opens the transport it needs.

mod chip;
pub mod session;
pub mod stc;
pub mod stm32;
pub mod wch;

pub use chip::{
    ChipInfo, ConnectOptions, Flasher, ProtocolFamily, ProtocolVariant, SessionState, TrimResult,
};
