//! ETX OTA frame codec.
//!
//! ## Frame Format
//!
//! All packets share one layout (multi-byte fields little-endian):
//!
//! ```text
//! +-----+------+--------+---------------+-------+-----------+
//! | SOF | Type | Length |    Payload    |  CRC  | CR  | LF  |
//! +-----+------+--------+---------------+-------+-----------+
//! | 1   | 1    | 2      |   variable    | 4     | 1   | 1   |
//! +-----+------+--------+---------------+-------+-----------+
//! | '$' | type | len    | payload bytes | crc32 | 0D  | 0A  |
//! +-----+------+--------+---------------+-------+-----------+
//! ```
//!
//! The CRC covers the payload only, through the fixed window of the packet
//! type (see [`crate::protocol::crc`]).

use crate::error::{Error, Result};
use crate::protocol::ProtocolConfig;
use crate::protocol::crc::{
    DATAPACK_WINDOW, crc_command, crc_fixed_datapack, crc_fixed16, crc_full_image,
};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;

/// Start of frame marker.
pub const SOF: u8 = b'$';

/// Frame terminator (CR LF).
pub const TERMINATOR: [u8; 2] = [0x0D, 0x0A];

/// Bytes added around the payload: SOF + type + length + CRC + CR LF.
pub const FRAME_OVERHEAD: usize = 10;

/// Offset of the payload inside a frame.
const PAYLOAD_OFFSET: usize = 4;

/// Header payload length.
pub const HEADER_PAYLOAD_LEN: usize = 16;

/// Bulk-header payload length.
pub const BULK_HEADER_PAYLOAD_LEN: usize = 4;

/// Packet type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum PacketType {
    /// One-byte command (start, end, abort).
    Command = 0,
    /// Firmware data chunk.
    Data = 1,
    /// Image size and CRC.
    Header = 2,
    /// CRC of the next page.
    BulkHeader = 3,
    /// Reserved for device responses; never sent by the host.
    Response = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Command),
            1 => Ok(Self::Data),
            2 => Ok(Self::Header),
            3 => Ok(Self::BulkHeader),
            4 => Ok(Self::Response),
            other => Err(Error::Protocol(format!("unknown packet type {other}"))),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "COMMAND"),
            Self::Data => write!(f, "DATA"),
            Self::Header => write!(f, "HEADER"),
            Self::BulkHeader => write!(f, "BULK_HEADER"),
            Self::Response => write!(f, "RESPONSE"),
        }
    }
}

/// Command codes carried by command frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Command {
    /// Begin an update session.
    Start = 0,
    /// Image complete; the device verifies and commits it.
    End = 1,
    /// Abandon the session.
    Abort = 2,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Start),
            1 => Ok(Self::End),
            2 => Ok(Self::Abort),
            other => Err(Error::Protocol(format!("unknown command {other}"))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::End => write!(f, "END"),
            Self::Abort => write!(f, "ABORT"),
        }
    }
}

/// Payload of a header frame (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPayload {
    /// Image size in bytes.
    pub image_size: u32,
    /// CRC of the whole image.
    pub image_crc: u32,
    /// Reserved, always zero.
    pub reserved1: u32,
    /// Reserved, always zero.
    pub reserved2: u32,
}

impl HeaderPayload {
    /// Describe `image`.
    pub fn for_image(image: &[u8]) -> Result<Self> {
        let image_size = u32::try_from(image.len()).map_err(|_| {
            Error::InvalidImage(format!("{} bytes exceeds the 32-bit size field", image.len()))
        })?;
        Ok(Self {
            image_size,
            image_crc: crc_full_image(image),
            reserved1: 0,
            reserved2: 0,
        })
    }

    /// Wire representation.
    pub fn to_bytes(&self) -> [u8; HEADER_PAYLOAD_LEN] {
        let mut buf = [0u8; HEADER_PAYLOAD_LEN];
        LittleEndian::write_u32_into(
            &[self.image_size, self.image_crc, self.reserved1, self.reserved2],
            &mut buf,
        );
        buf
    }

    /// Parse a header payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != HEADER_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "header payload must be {HEADER_PAYLOAD_LEN} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            image_size: LittleEndian::read_u32(&data[0..4]),
            image_crc: LittleEndian::read_u32(&data[4..8]),
            reserved1: LittleEndian::read_u32(&data[8..12]),
            reserved2: LittleEndian::read_u32(&data[12..16]),
        })
    }
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    packet_type: PacketType,
    payload: Vec<u8>,
    crc: u32,
}

impl Frame {
    /// CRC the device expects for `payload` sent as `packet_type`.
    pub fn expected_crc(packet_type: PacketType, payload: &[u8]) -> u32 {
        match packet_type {
            // Response frames carry a one-byte status, checked like a command.
            PacketType::Command | PacketType::Response => {
                crc_command(payload.first().copied().unwrap_or_default())
            },
            PacketType::Data => crc_fixed_datapack(payload),
            PacketType::Header | PacketType::BulkHeader => crc_fixed16(payload),
        }
    }

    /// Packet type.
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// CRC field.
    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Command carried by a command frame.
    pub fn command(&self) -> Option<Command> {
        if self.packet_type != PacketType::Command {
            return None;
        }
        self.payload
            .first()
            .and_then(|&b| Command::try_from(b).ok())
    }

    /// Total bytes on the wire.
    pub fn wire_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// Serialize the frame.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());

        buf.push(SOF);
        buf.push(self.packet_type as u8);
        // Payload length is bounded by the encoder to fit u16
        buf.write_u16::<LittleEndian>(self.payload.len() as u16)
            .unwrap();
        buf.extend_from_slice(&self.payload);
        buf.write_u32::<LittleEndian>(self.crc).unwrap();
        buf.extend_from_slice(&TERMINATOR);

        buf
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns `Ok(None)` while `data` holds only part of a frame, otherwise
    /// the frame and the number of bytes it occupied. Structure and CRC are
    /// checked the way the device checks them.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(&sof) = data.first() else {
            return Ok(None);
        };
        if sof != SOF {
            return Err(Error::Protocol(format!("bad start of frame 0x{sof:02X}")));
        }
        if data.len() < PAYLOAD_OFFSET {
            return Ok(None);
        }

        let packet_type = PacketType::try_from(data[1])?;
        let len = usize::from(LittleEndian::read_u16(&data[2..4]));
        check_payload_len(packet_type, len)?;

        let total = len + FRAME_OVERHEAD;
        if data.len() < total {
            return Ok(None);
        }

        let payload = &data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + len];
        let crc_pos = PAYLOAD_OFFSET + len;
        let crc = LittleEndian::read_u32(&data[crc_pos..crc_pos + 4]);
        if data[crc_pos + 4..total] != TERMINATOR {
            return Err(Error::Protocol("missing CR LF terminator".into()));
        }

        let actual = Self::expected_crc(packet_type, payload);
        if actual != crc {
            return Err(Error::CrcMismatch {
                expected: crc,
                actual,
            });
        }

        let frame = Self {
            packet_type,
            payload: payload.to_vec(),
            crc,
        };
        Ok(Some((frame, total)))
    }
}

fn check_payload_len(packet_type: PacketType, len: usize) -> Result<()> {
    let ok = match packet_type {
        PacketType::Command | PacketType::Response => len == 1,
        PacketType::Header => len == HEADER_PAYLOAD_LEN,
        PacketType::BulkHeader => len == BULK_HEADER_PAYLOAD_LEN,
        PacketType::Data => (1..=DATAPACK_WINDOW).contains(&len),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "invalid {packet_type} payload length {len}"
        )))
    }
}

/// Builds host frames for a fixed [`ProtocolConfig`].
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    config: ProtocolConfig,
}

impl FrameEncoder {
    /// Create an encoder.
    pub fn new(config: ProtocolConfig) -> Self {
        Self { config }
    }

    /// Geometry in use.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Build a command frame.
    pub fn encode_command(&self, command: Command) -> Frame {
        let code = command as u8;
        Frame {
            packet_type: PacketType::Command,
            payload: vec![code],
            crc: crc_command(code),
        }
    }

    /// Build the header frame describing `image`.
    pub fn encode_header(&self, image: &[u8]) -> Result<Frame> {
        let payload = HeaderPayload::for_image(image)?.to_bytes();
        Ok(Frame {
            packet_type: PacketType::Header,
            crc: crc_fixed16(&payload),
            payload: payload.to_vec(),
        })
    }

    /// Build the bulk-header frame announcing `page`.
    pub fn encode_bulk_header(&self, page: &[u8]) -> Frame {
        let payload = crc_full_image(page).to_le_bytes();
        Frame {
            packet_type: PacketType::BulkHeader,
            // 4 payload bytes, checked by the device over a 16-byte window
            crc: crc_fixed16(&payload),
            payload: payload.to_vec(),
        }
    }

    /// Build a data frame carrying `chunk` verbatim.
    ///
    /// The CRC always covers the device's full 256-byte data field,
    /// whatever the configured chunk size.
    pub fn encode_data(&self, chunk: &[u8]) -> Result<Frame> {
        if chunk.is_empty() || chunk.len() > self.config.chunk_size {
            return Err(Error::Protocol(format!(
                "data chunk must be 1..={} bytes, got {}",
                self.config.chunk_size,
                chunk.len()
            )));
        }
        Ok(Frame {
            packet_type: PacketType::Data,
            crc: crc_fixed_datapack(chunk),
            payload: chunk.to_vec(),
        })
    }
}

/// Splits a captured byte stream into frames.
///
/// Undecodable bytes are reported once and skipped up to the next SOF, so a
/// corrupted frame does not hide the frames after it.
#[derive(Debug)]
pub struct FrameScanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameScanner<'a> {
    /// Scan `data` from the start.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Offset of the next unread byte.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn resync(&mut self) {
        let rest = &self.data[self.pos + 1..];
        self.pos = rest
            .iter()
            .position(|&b| b == SOF)
            .map_or(self.data.len(), |i| self.pos + 1 + i);
    }
}

impl Iterator for FrameScanner<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        match Frame::decode(&self.data[self.pos..]) {
            Ok(Some((frame, used))) => {
                self.pos += used;
                Some(Ok(frame))
            },
            Ok(None) => {
                let remaining = self.data.len() - self.pos;
                self.pos = self.data.len();
                Some(Err(Error::Protocol(format!(
                    "truncated frame ({remaining} trailing bytes)"
                ))))
            },
            Err(e) => {
                self.resync();
                Some(Err(e))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> FrameEncoder {
        FrameEncoder::new(ProtocolConfig::default())
    }

    #[test]
    fn test_command_frame_layout() {
        let data = encoder().encode_command(Command::Start).to_bytes();
        assert_eq!(
            data,
            [b'$', 0x00, 0x01, 0x00, 0x00, 0x7B, 0xDD, 0x04, 0xC7, 0x0D, 0x0A]
        );
    }

    #[test]
    fn test_end_command_crc() {
        let frame = encoder().encode_command(Command::End);
        assert_eq!(frame.payload(), &[1]);
        assert_eq!(frame.crc(), 0x1B69_47CC);
        assert_eq!(frame.command(), Some(Command::End));
        assert_eq!(frame.wire_len(), 11);
    }

    #[test]
    fn test_header_frame() {
        let frame = encoder().encode_header(b"123456789").unwrap();
        let data = frame.to_bytes();

        assert_eq!(data.len(), 16 + FRAME_OVERHEAD);
        assert_eq!(data[1], PacketType::Header as u8);
        assert_eq!(&data[2..4], &[16, 0]);
        assert_eq!(LittleEndian::read_u32(&data[4..8]), 9);
        assert_eq!(LittleEndian::read_u32(&data[8..12]), 0x0376_E6E7);
        assert_eq!(&data[12..20], &[0u8; 8]);
        assert_eq!(frame.crc(), 0xE99C_A9D9);
        assert_eq!(&data[24..], &TERMINATOR);
    }

    #[test]
    fn test_header_payload_round_trip_size() {
        let image = vec![0x5Au8; 5000];
        let frame = encoder().encode_header(&image).unwrap();
        let header = HeaderPayload::from_bytes(frame.payload()).unwrap();
        assert_eq!(header.image_size, 5000);
        assert_eq!(header.image_crc, crc_full_image(&image));
        assert_eq!(header.reserved1, 0);
        assert_eq!(header.reserved2, 0);
    }

    #[test]
    fn test_bulk_header_frame() {
        let frame = encoder().encode_bulk_header(b"123456789");
        assert_eq!(frame.payload(), &0x0376_E6E7u32.to_le_bytes());
        assert_eq!(frame.crc(), 0x0210_F910);
        assert_eq!(frame.wire_len(), 14);
    }

    #[test]
    fn test_data_frame_keeps_real_length() {
        let frame = encoder().encode_data(&[1, 2, 3]).unwrap();
        let data = frame.to_bytes();
        assert_eq!(&data[2..4], &[3, 0]);
        assert_eq!(&data[4..7], &[1, 2, 3]);
        assert_eq!(frame.crc(), 0xD12B_1A04);
        assert_eq!(data.len(), 13);
    }

    #[test]
    fn test_data_crc_ignores_chunk_size() {
        let chunk = [0xA5u8; 100];
        for chunk_size in [64, 128, 256] {
            let enc = FrameEncoder::new(ProtocolConfig::new(2048, chunk_size).unwrap());
            let frame = enc.encode_data(&chunk).unwrap();
            assert_eq!(frame.crc(), crc_fixed_datapack(&chunk));
            assert_eq!(frame.crc(), 0x49AE_BED3);
            assert!(Frame::decode(&frame.to_bytes()).unwrap().is_some());
        }
    }

    #[test]
    fn test_data_frame_rejects_bad_sizes() {
        assert!(matches!(
            encoder().encode_data(&[]),
            Err(Error::Protocol(_))
        ));
        assert!(encoder().encode_data(&[0u8; 257]).is_err());
        assert!(encoder().encode_data(&[0u8; 256]).is_ok());
    }

    #[test]
    fn test_decode_encoded_frames() {
        let enc = encoder();
        let frames = [
            enc.encode_command(Command::Start),
            enc.encode_header(&[7u8; 100]).unwrap(),
            enc.encode_bulk_header(&[7u8; 100]),
            enc.encode_data(&[7u8; 100]).unwrap(),
        ];
        for frame in &frames {
            let bytes = frame.to_bytes();
            let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
            assert_eq!(&decoded, frame);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn test_decode_partial_frame() {
        let bytes = encoder().encode_data(&[1u8; 40]).unwrap().to_bytes();
        assert!(Frame::decode(&bytes[..3]).unwrap().is_none());
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).unwrap().is_none());
        assert!(Frame::decode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_decode_detects_corruption() {
        let mut bytes = encoder().encode_data(&[1u8; 40]).unwrap().to_bytes();
        bytes[10] ^= 0xFF;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_structure() {
        assert!(Frame::decode(b"#abc").is_err());

        let mut bytes = encoder().encode_command(Command::End).to_bytes();
        bytes[10] = 0x00;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(Error::Protocol(_))
        ));

        let bad_type = [b'$', 9, 1, 0];
        assert!(Frame::decode(&bad_type).is_err());
    }

    #[test]
    fn test_scanner_resyncs_after_garbage() {
        let enc = encoder();
        let mut stream = vec![0x00, 0x11];
        stream.extend(enc.encode_command(Command::Start).to_bytes());
        let mut corrupted = enc.encode_bulk_header(&[1, 2, 3]).to_bytes();
        corrupted[5] ^= 0x01;
        stream.extend(corrupted);
        stream.extend(enc.encode_command(Command::End).to_bytes());

        let results: Vec<_> = FrameScanner::new(&stream).collect();
        let ok: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();

        assert_eq!(ok.len(), 2);
        assert_eq!(ok[0].command(), Some(Command::Start));
        assert_eq!(ok[1].command(), Some(Command::End));
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 2);
    }

    #[test]
    fn test_scanner_reports_truncated_tail() {
        let bytes = encoder().encode_command(Command::Start).to_bytes();
        let results: Vec<_> = FrameScanner::new(&bytes[..6]).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
