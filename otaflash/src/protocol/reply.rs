//! Device replies.
//!
//! The bootloader answers with short ASCII lines rather than response
//! frames. Lines may carry NUL bytes (the device transmits `sizeof` its
//! string literals) and the page acknowledgement `ACK` is sent without a
//! line terminator.

/// Page committed / session started.
pub const TOKEN_ACK: &str = "ACK";

/// Page CRC mismatch; the page must be resent.
pub const TOKEN_NACK: &str = "NACK";

/// Header accepted.
pub const TOKEN_HEADER_OK: &str = "HEADER_OK";

/// A classified device line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `ACK`
    Ack,
    /// `NACK`
    Nack,
    /// `HEADER_OK`
    HeaderOk,
    /// Any other non-empty line (`BULK_OK`, `DATA_OK`, debug output).
    Other(String),
    /// Nothing left after normalization.
    Empty,
}

impl Reply {
    /// Classify a raw line.
    pub fn parse(raw: &[u8]) -> Self {
        let line = normalize(raw);
        match line.as_str() {
            "" => Self::Empty,
            TOKEN_ACK => Self::Ack,
            TOKEN_NACK => Self::Nack,
            TOKEN_HEADER_OK => Self::HeaderOk,
            _ => Self::Other(line),
        }
    }

    /// True for any line with content.
    pub fn is_some_line(&self) -> bool {
        !matches!(self, Self::Empty)
    }
}

/// Decode lossily, drop NUL bytes and trim surrounding whitespace.
pub fn normalize(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace('\0', "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens() {
        assert_eq!(Reply::parse(b"ACK\r\n"), Reply::Ack);
        assert_eq!(Reply::parse(b"NACK\n"), Reply::Nack);
        assert_eq!(Reply::parse(b"HEADER_OK\n"), Reply::HeaderOk);
    }

    #[test]
    fn test_nul_and_missing_terminator() {
        assert_eq!(Reply::parse(b"ACK\0"), Reply::Ack);
        assert_eq!(Reply::parse(b"\0NACK\n\0"), Reply::Nack);
        assert_eq!(Reply::parse(b"\0DATA_OK\n"), Reply::Other("DATA_OK".into()));
    }

    #[test]
    fn test_case_sensitive() {
        assert_eq!(Reply::parse(b"ack\n"), Reply::Other("ack".into()));
        assert_eq!(Reply::parse(b"ACKNOWLEDGED"), Reply::Other("ACKNOWLEDGED".into()));
    }

    #[test]
    fn test_empty_lines() {
        assert_eq!(Reply::parse(b"\r\n"), Reply::Empty);
        assert_eq!(Reply::parse(b"\0\0"), Reply::Empty);
        assert!(!Reply::parse(b"  ").is_some_line());
        assert!(Reply::parse(b"BULK_OK\n").is_some_line());
    }

    #[test]
    fn test_invalid_utf8_is_other() {
        assert!(matches!(Reply::parse(&[0xFF, 0xFE]), Reply::Other(_)));
    }
}
