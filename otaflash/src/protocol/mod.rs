//! Protocol implementations.
//!
//! The ETX OTA protocol moves a firmware image in pages ("bulks") made of
//! data chunks. Every host message is a [`Frame`]; the device answers with
//! short text lines classified by [`reply`].

pub mod crc;
pub mod frame;
pub mod reply;

use crate::error::{Error, Result};
use crate::protocol::crc::DATAPACK_WINDOW;

// Re-export common types
pub use frame::{Command, Frame, FrameEncoder, FrameScanner, HeaderPayload, PacketType};
pub use reply::Reply;

/// Default flash page ("bulk") size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 2048;

/// Default data chunk size in bytes (`ETX_OTA_DATA_MAX_SIZE` on the device).
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Page and chunk geometry shared by the codec, the image and the transfer.
///
/// Chunks may be smaller than the device's 256-byte data field but never
/// larger; data CRCs always cover the full field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolConfig {
    /// Bytes per page; the device commits and acknowledges one page at a time.
    pub page_size: usize,
    /// Bytes per data frame, at most 256.
    pub chunk_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ProtocolConfig {
    /// Create and validate a configuration.
    pub fn new(page_size: usize, chunk_size: usize) -> Result<Self> {
        let config = Self {
            page_size,
            chunk_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the geometry can be expressed on the wire.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::Config("page size must be non-zero".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be non-zero".into()));
        }
        if self.chunk_size > DATAPACK_WINDOW {
            return Err(Error::Config(format!(
                "chunk size {} exceeds the {DATAPACK_WINDOW}-byte device data field",
                self.chunk_size
            )));
        }
        if u32::try_from(self.page_size).is_err() {
            return Err(Error::Config(format!(
                "page size {} does not fit 32 bits",
                self.page_size
            )));
        }
        Ok(())
    }

    /// Number of chunks needed for `page_len` bytes.
    pub fn chunks_in(&self, page_len: usize) -> usize {
        page_len.div_ceil(self.chunk_size)
    }

    /// Number of chunks in a full page.
    pub fn chunks_per_page(&self) -> usize {
        self.chunks_in(self.page_size)
    }

    /// Number of pages needed for `image_len` bytes.
    pub fn pages_in(&self, image_len: usize) -> usize {
        image_len.div_ceil(self.page_size)
    }
}
