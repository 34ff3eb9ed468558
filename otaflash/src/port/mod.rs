//! Port abstraction for serial communication.
//!
//! The transfer logic only needs a byte stream (`Read + Write`). This module
//! adds the pieces around it:
//!
//! - [`Port`]: an 8N1 serial port polled with a short per-read timeout,
//!   implemented for native platforms by [`NativePort`] (`serialport` crate)
//! - [`LineReader`]: turns polled reads into device reply lines with an
//!   overall deadline
//!
//! ```text
//! +------------------+
//! |  OtaTransfer     |  frames out, reply lines in
//! +--------+---------+
//!          |
//! +--------+---------+
//! |   LineReader     |  CR/LF framing, deadline, interrupt checks
//! +--------+---------+
//!          |
//! +--------+---------+
//! |   Port / Read    |  NativePort (serialport) or any byte stream
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use otaflash::port::{NativePort, Port, SerialConfig};
//!
//! fn main() -> otaflash::Result<()> {
//!     let mut port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     port.clear_buffers()?;
//!     port.close()
//! }
//! ```

pub mod line;
#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

pub use line::LineReader;
#[cfg(feature = "native")]
pub use native::NativePort;

/// Default baud rate of the bootloader UART.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default per-read timeout used to poll the port.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port configuration.
///
/// The bootloader UART is fixed at 8 data bits, no parity, one stop bit and
/// no flow control; only the name, speed and polling timeout vary.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Per-read timeout. Reads that time out are retried by the caller.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the per-read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port used to talk to the bootloader.
pub trait Port: Read + Write + Send {
    /// Discard bytes queued in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Port name/path.
    fn name(&self) -> &str;

    /// Close the port. Later reads and writes fail with `NotConnected`.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.timeout, DEFAULT_POLL_TIMEOUT);
        assert!(config.port_name.is_empty());
    }

    #[test]
    fn test_serial_config_builder() {
        let config =
            SerialConfig::new("/dev/ttyUSB0", 57600).with_timeout(Duration::from_millis(20));

        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.timeout, Duration::from_millis(20));
    }
}
