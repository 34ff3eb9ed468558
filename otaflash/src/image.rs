//! Firmware images and their page/chunk layout.
//!
//! An image is read into memory once and never modified. It is sent as a
//! sequence of pages (the device's flash commit unit), each made of data
//! chunks:
//!
//! ```text
//! image:  |<------- page 0 ------->|<------- page 1 ------->|<- page 2 ->|
//! chunks: | c0 | c1 | ...     | c7 | c0 | c1 | ...     | c7 | c0 | .. |c3|
//! ```
//!
//! Only the final page and the final chunk of a page may be short.

use crate::error::{Error, Result};
use crate::protocol::ProtocolConfig;
use crate::protocol::crc::crc_full_image;
use log::debug;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// An immutable firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Load an image from a raw binary file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        Self::from_bytes(data)
    }

    /// Wrap raw image bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        if u32::try_from(data.len()).is_err() {
            return Err(Error::InvalidImage(format!(
                "{} bytes exceeds the 32-bit size field",
                data.len()
            )));
        }
        Ok(Self { data })
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; empty images are rejected on construction.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whole-image CRC, as announced in the header frame.
    pub fn crc(&self) -> u32 {
        crc_full_image(&self.data)
    }

    /// Number of pages under `config`.
    pub fn page_count(&self, config: &ProtocolConfig) -> usize {
        config.pages_in(self.data.len())
    }

    /// Total number of data frames under `config`.
    pub fn chunk_count(&self, config: &ProtocolConfig) -> usize {
        self.pages(config).map(|p| p.chunk_count(config)).sum()
    }

    /// Page `index`, if it exists.
    pub fn page(&self, config: &ProtocolConfig, index: usize) -> Option<Page<'_>> {
        let offset = index.checked_mul(config.page_size)?;
        if offset >= self.data.len() {
            return None;
        }
        let end = (offset + config.page_size).min(self.data.len());
        Some(Page {
            index,
            offset,
            data: &self.data[offset..end],
        })
    }

    /// Iterate over the pages.
    pub fn pages<'a>(&'a self, config: &'a ProtocolConfig) -> impl Iterator<Item = Page<'a>> + 'a {
        (0..self.page_count(config)).filter_map(move |i| self.page(config, i))
    }
}

/// One page of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page<'a> {
    /// Zero-based page number.
    pub index: usize,
    /// Byte offset of the page in the image.
    pub offset: usize,
    /// Page bytes.
    pub data: &'a [u8],
}

impl<'a> Page<'a> {
    /// Page length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length page (never produced by [`FirmwareImage`]).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// CRC announced in the bulk header.
    pub fn crc(&self) -> u32 {
        crc_full_image(self.data)
    }

    /// Number of data frames for this page.
    pub fn chunk_count(&self, config: &ProtocolConfig) -> usize {
        config.chunks_in(self.data.len())
    }

    /// The page's chunks, in order.
    pub fn chunks(&self, config: &ProtocolConfig) -> std::slice::Chunks<'a, u8> {
        self.data.chunks(config.chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image(len: usize) -> FirmwareImage {
        #[allow(clippy::cast_possible_truncation)]
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        FirmwareImage::from_bytes(data).unwrap()
    }

    #[test]
    fn test_rejects_empty_image() {
        assert!(matches!(
            FirmwareImage::from_bytes(Vec::new()),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_5000_byte_layout() {
        let config = ProtocolConfig::default();
        let img = image(5000);

        let pages: Vec<_> = img.pages(&config).collect();
        assert_eq!(pages.len(), 3);
        assert_eq!(
            pages.iter().map(Page::len).collect::<Vec<_>>(),
            [2048, 2048, 904]
        );
        assert_eq!(pages[2].offset, 4096);

        let last_chunks: Vec<usize> = pages[2].chunks(&config).map(<[u8]>::len).collect();
        assert_eq!(last_chunks, [256, 256, 256, 136]);
        assert_eq!(img.chunk_count(&config), 20);
    }

    #[test]
    fn test_exact_multiple_has_full_last_page() {
        let config = ProtocolConfig::default();
        let img = image(4096);

        assert_eq!(img.page_count(&config), 2);
        let last = img.page(&config, 1).unwrap();
        assert_eq!(last.chunk_count(&config), 8);
        assert!(img.page(&config, 2).is_none());
    }

    #[test]
    fn test_non_multiple_page_size() {
        let config = ProtocolConfig::new(600, 256).unwrap();
        let img = image(1000);

        let counts: Vec<usize> = img.pages(&config).map(|p| p.chunk_count(&config)).collect();
        assert_eq!(counts, [3, 2]);
        let sizes: Vec<usize> = img
            .page(&config, 0)
            .unwrap()
            .chunks(&config)
            .map(<[u8]>::len)
            .collect();
        assert_eq!(sizes, [256, 256, 88]);
    }

    #[test]
    fn test_page_crc_matches_slice() {
        let config = ProtocolConfig::default();
        let img = image(3000);
        let page = img.page(&config, 1).unwrap();
        assert_eq!(page.crc(), crc_full_image(&img.data()[2048..3000]));
        assert_eq!(img.crc(), crc_full_image(img.data()));
    }

    #[test]
    fn test_from_file() {
        let mut file = std::env::temp_dir();
        file.push(format!("otaflash-image-{}.bin", std::process::id()));
        std::fs::File::create(&file)
            .unwrap()
            .write_all(b"123456789")
            .unwrap();

        let img = FirmwareImage::from_file(&file).unwrap();
        std::fs::remove_file(&file).unwrap();

        assert_eq!(img.len(), 9);
        assert_eq!(img.crc(), 0x0376_E6E7);
    }

    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            FirmwareImage::from_file("/nonexistent/otaflash.bin"),
            Err(Error::Io(_))
        ));
    }
}
