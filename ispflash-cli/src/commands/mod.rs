//! Command implementations.
//!
//! Operations that touch a chip live in `flash`; read-only reporting in `info`.

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod info;
