//! Error types for otaflash.

use std::io;
use thiserror::Error;

/// Result type for otaflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for otaflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The firmware image cannot be transferred.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Malformed frame or a payload the codec cannot encode.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// CRC checksum mismatch while decoding a frame.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// CRC carried by the frame.
        expected: u32,
        /// CRC computed over the payload.
        actual: u32,
    },

    /// No acknowledgement arrived within the configured wait.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device kept rejecting a page.
    #[error("Transfer failed: page {page_index} rejected after {retries} retries")]
    TransferFailed {
        /// Zero-based index of the rejected page.
        page_index: usize,
        /// Number of resends attempted for the page.
        retries: u32,
    },

    /// The embedding application requested cancellation.
    #[error("Operation interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if no reply arrived before the deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
