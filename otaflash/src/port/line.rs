//! Line framing for device replies.

use crate::error::{Error, Result};
use log::trace;
use std::io::{ErrorKind, Read};
use std::time::Instant;

/// Size of a single polling read.
const READ_CHUNK: usize = 64;

/// Reads LF-terminated lines from a polled byte stream.
///
/// Bytes after the end of a line stay buffered for the next call. When a
/// poll times out with unterminated bytes pending, those bytes are returned
/// as a line: the bootloader ends its page acknowledgement with a NUL
/// instead of a newline.
#[derive(Debug, Default)]
pub struct LineReader {
    pending: Vec<u8>,
}

impl LineReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet returned.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Drop buffered bytes.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Read one line, terminator included.
    ///
    /// Empty or timed-out polls are retried until `deadline`; `None` waits
    /// forever. The library interrupt checker is consulted between polls.
    pub fn read_line<R: Read + ?Sized>(
        &mut self,
        port: &mut R,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>> {
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                trace!("Line: {:?}", String::from_utf8_lossy(&line));
                return Ok(line);
            }

            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(Error::Timeout("no reply from device".into()));
            }

            match port.read(&mut buf) {
                Ok(0) => {
                    if let Some(line) = self.flush_partial() {
                        return Ok(line);
                    }
                },
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    if let Some(line) = self.flush_partial() {
                        return Ok(line);
                    }
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn flush_partial(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        trace!(
            "Unterminated line: {:?}",
            String::from_utf8_lossy(&self.pending)
        );
        Some(std::mem::take(&mut self.pending))
    }
}
