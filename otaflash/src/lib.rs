//! # otaflash
//!
//! A library for updating firmware through the ETX OTA UART bootloader.
//!
//! This crate provides the host side of the protocol:
//!
//! - CRC-32/MPEG-2 engine with the device's fixed-window variants
//! - Frame encoding, verifying decoding and capture scanning
//! - Page/chunk transfer state machine with NACK retry
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//!
//! Any `Read + Write` byte stream can drive a transfer, so the protocol is
//! usable without the `native` feature.
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use otaflash::{FirmwareImage, OtaTransfer, TransferEvent};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("app.bin")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut port = otaflash::NativePort::open(&otaflash::port::SerialConfig::new(
//!             "/dev/ttyUSB0",
//!             115200,
//!         ))?;
//!         let stats = OtaTransfer::new(&mut port).run(&image, |event| {
//!             if let TransferEvent::PageCommitted { page_index } = event {
//!                 println!("page {page_index} written");
//!             }
//!         })?;
//!         println!("{} pages, {} NACKs", stats.pages, stats.nacks);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod transfer;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

/// Set the interrupt flag seen by the calling test thread.
///
/// The flag is thread-local so a test that interrupts itself does not stop
/// transfers running concurrently in other tests.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::cell::Cell;
    use std::sync::Once;

    thread_local! {
        static TEST_INTERRUPTED: Cell<bool> = const { Cell::new(false) };
    }
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| set_interrupt_checker(|| TEST_INTERRUPTED.with(Cell::get)));
    TEST_INTERRUPTED.with(|flag| flag.set(value));
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result},
    image::{FirmwareImage, Page},
    port::{LineReader, Port, SerialConfig},
    protocol::{
        Command, Frame, FrameEncoder, FrameScanner, PacketType, ProtocolConfig, Reply,
        crc::{Crc32, crc_full_image},
    },
    transfer::{OtaTransfer, TransferConfig, TransferEvent, TransferState, TransferStats},
};
