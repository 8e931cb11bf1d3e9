//! Frame codecs, checksums and ciphers of the supported bootloaders.

pub mod checksum;
pub mod cipher;
pub mod stc;
pub mod uart;
pub mod wch;

pub use cipher::XorKey;
