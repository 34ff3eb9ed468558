//! CRC-32 checksums used by the ETX OTA bootloader.
//!
//! The bootloader uses a table-driven CRC-32 with the MPEG-2 parameters:
//!
//! | Parameter | Value        |
//! |-----------|--------------|
//! | Width     | 32           |
//! | Poly      | `0x04C11DB7` |
//! | Init      | `0xFFFFFFFF` |
//! | RefIn     | false        |
//! | RefOut    | false        |
//! | XorOut    | `0x00000000` |
//! | Check     | `0x0376E6E7` |
//!
//! The device feeds data as 32-bit big-endian words, most significant byte
//! first, which is byte-for-byte the same as feeding the buffer in order.
//!
//! ## Fixed windows
//!
//! Frame CRCs are not computed over the payload length. The device runs its
//! CRC over the whole receive field of the packet structure, so the host must
//! do the same: 16 bytes for header and bulk-header payloads, 256 bytes for
//! data payloads, with the unused tail treated as zero.

/// CRC-32/MPEG-2 polynomial.
pub const CRC32_POLY: u32 = 0x04C1_1DB7;

/// CRC-32/MPEG-2 initial value.
pub const CRC32_INIT: u32 = 0xFFFF_FFFF;

/// Byte window covered by header and bulk-header frame CRCs.
pub const FIXED16_WINDOW: usize = 16;

/// Byte window covered by data frame CRCs.
pub const DATAPACK_WINDOW: usize = 256;

/// Lookup table, generated from [`CRC32_POLY`] at compile time.
pub static CRC32_TABLE: [u32; 256] = make_table();

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        #[allow(clippy::cast_possible_truncation)]
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ CRC32_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental CRC-32/MPEG-2 state.
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    value: u32,
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    /// Start a new computation.
    pub const fn new() -> Self {
        Self { value: CRC32_INIT }
    }

    /// Feed one byte.
    #[inline]
    pub fn update_byte(&mut self, byte: u8) {
        let idx = ((self.value >> 24) ^ u32::from(byte)) & 0xFF;
        self.value = (self.value << 8) ^ CRC32_TABLE[idx as usize];
    }

    /// Feed a slice.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        for &byte in data {
            self.update_byte(byte);
        }
        self
    }

    /// Feed `count` zero bytes.
    pub fn update_zeros(&mut self, count: usize) -> &mut Self {
        for _ in 0..count {
            self.update_byte(0);
        }
        self
    }

    /// Current CRC value (no final XOR).
    pub fn value(&self) -> u32 {
        self.value
    }
}

/// CRC of a whole firmware image (or one page of it).
///
/// Complete words are consumed MSB first; the 1-3 trailing bytes are fed
/// as the leading bytes of a final zero-padded word, without its padding.
/// An empty input yields the initial value `0xFFFFFFFF`.
pub fn crc_full_image(data: &[u8]) -> u32 {
    Crc32::new().update(data).value()
}

/// CRC over a fixed window of `window` bytes.
///
/// Input shorter than the window is zero-padded, longer input is cut at the
/// window. The padding mirrors the bootloader, which always checks the full
/// field of its packed packet structure regardless of the payload length.
pub fn crc_fixed_window(data: &[u8], window: usize) -> u32 {
    let used = data.len().min(window);
    Crc32::new()
        .update(&data[..used])
        .update_zeros(window - used)
        .value()
}

/// CRC of a header or bulk-header payload: always exactly 16 bytes.
pub fn crc_fixed16(data: &[u8]) -> u32 {
    crc_fixed_window(data, FIXED16_WINDOW)
}

/// CRC of a data payload: always exactly 256 bytes.
pub fn crc_fixed_datapack(data: &[u8]) -> u32 {
    crc_fixed_window(data, DATAPACK_WINDOW)
}

/// CRC of a one-byte command, taken as the MSB of a single zero word.
pub fn crc_command(command: u8) -> u32 {
    Crc32::new().update(&[command, 0, 0, 0]).value()
}
