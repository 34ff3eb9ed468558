//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod decode;
pub(crate) mod flash;
pub(crate) mod info;
