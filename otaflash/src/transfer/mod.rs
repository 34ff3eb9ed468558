//! ETX OTA image transfer.
//!
//! ## Session Overview
//!
//! ```text
//! host                                   device
//!  | -- CMD START ----------------------> |
//!  | <--------------------------- "ACK" -- |
//!  | -- HEADER (size, image crc) -------> |
//!  | <--------------------- "HEADER_OK" -- |
//!  |                                      |
//!  |   for each page:                     |
//!  | -- BULK_HEADER (page crc) ---------> |
//!  | <-------------------- any line ------ |   BULK_OK
//!  | -- DATA chunk 0 -------------------> |
//!  | <-------------------- any line ------ |   DATA_OK
//!  |    ...                               |
//!  | -- DATA last chunk ----------------> |
//!  | <-------------------- ACK / NACK ---- |   NACK: resend the whole page
//!  |                                      |
//!  | -- CMD END ------------------------> |
//! ```
//!
//! Every wait is bounded by [`TransferConfig::ack_timeout`] and a page is
//! resent at most [`TransferConfig::max_page_retries`] times.

use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::port::LineReader;
use crate::protocol::{Command, Frame, FrameEncoder, ProtocolConfig, Reply};
use log::{debug, info, trace, warn};
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};


/// Default bound on a single acknowledgement wait.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of resends allowed for one page.
pub const DEFAULT_MAX_PAGE_RETRIES: u32 = 10;

/// Pause after the start ACK, for the device to erase its download bank.
pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(500);

/// Pause after `HEADER_OK`.
pub const DEFAULT_HEADER_DELAY: Duration = Duration::from_millis(100);

/// Pause after a bulk header, for the device to erase/prepare the page.
pub const DEFAULT_BULK_DELAY: Duration = Duration::from_millis(100);

/// Pause after each data chunk.
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Pause before the end command.
pub const DEFAULT_END_DELAY: Duration = Duration::from_millis(100);

/// Transfer configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Page and chunk geometry.
    pub protocol: ProtocolConfig,
    /// Bound on each acknowledgement wait; `None` waits forever.
    pub ack_timeout: Option<Duration>,
    /// Resends allowed per page before giving up; `None` retries forever.
    pub max_page_retries: Option<u32>,
    /// Delay after the start ACK.
    pub start_delay: Duration,
    /// Delay after `HEADER_OK`.
    pub header_delay: Duration,
    /// Delay after each bulk header.
    pub bulk_delay: Duration,
    /// Delay after each data chunk.
    pub chunk_delay: Duration,
    /// Delay before the end command.
    pub end_delay: Duration,
    /// Send an abort command when the transfer fails after starting.
    pub abort_on_failure: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            ack_timeout: Some(DEFAULT_ACK_TIMEOUT),
            max_page_retries: Some(DEFAULT_MAX_PAGE_RETRIES),
            start_delay: DEFAULT_START_DELAY,
            header_delay: DEFAULT_HEADER_DELAY,
            bulk_delay: DEFAULT_BULK_DELAY,
            chunk_delay: DEFAULT_CHUNK_DELAY,
            end_delay: DEFAULT_END_DELAY,
            abort_on_failure: true,
        }
    }
}

impl TransferConfig {
    /// Remove all inter-packet delays.
    #[must_use]
    pub fn without_delays(mut self) -> Self {
        self.start_delay = Duration::ZERO;
        self.header_delay = Duration::ZERO;
        self.bulk_delay = Duration::ZERO;
        self.chunk_delay = Duration::ZERO;
        self.end_delay = Duration::ZERO;
        self
    }
}

/// Progress notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// The device acknowledged the start command.
    Started,
    /// The device accepted the header.
    HeaderAccepted {
        /// Image size.
        image_size: usize,
        /// Whole-image CRC.
        image_crc: u32,
    },
    /// A page (re)starts with its bulk header.
    PageStarted {
        /// Page number.
        page_index: usize,
        /// 1 for the first send, incremented on each resend.
        attempt: u32,
    },
    /// A data chunk was written.
    ChunkSent {
        /// Page number.
        page_index: usize,
        /// Chunk number within the page.
        chunk_index: usize,
        /// Image bytes sent so far (rewinds on page resend).
        offset: usize,
        /// Image size.
        total: usize,
    },
    /// The device committed a page.
    PageCommitted {
        /// Page number.
        page_index: usize,
    },
    /// The device rejected a page.
    PageRejected {
        /// Page number.
        page_index: usize,
        /// Consecutive rejections of this page.
        rejections: u32,
    },
    /// The end command was sent.
    Finished,
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TransferStats {
    /// Pages committed by the device.
    pub pages: usize,
    /// Frames written, resends included.
    pub frames_sent: usize,
    /// Bytes written, resends included.
    pub bytes_sent: usize,
    /// Page rejections received.
    pub nacks: u32,
    /// Wall-clock duration.
    pub elapsed: Duration,
}

/// Cursor of the page loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferState {
    /// Next image byte to send.
    pub offset: usize,
    /// Chunks of the current page already sent.
    pub chunk_index_in_page: usize,
    /// Current page.
    pub page_index: usize,
    /// Rejections of the current page so far.
    pub page_retries: u32,
}

/// ETX OTA transfer handler.
pub struct OtaTransfer<'a, P: Read + Write> {
    port: &'a mut P,
    config: TransferConfig,
    encoder: FrameEncoder,
    reader: LineReader,
    stats: TransferStats,
}

impl<'a, P: Read + Write> OtaTransfer<'a, P> {
    /// Create a transfer handler with default configuration.
    pub fn new(port: &'a mut P) -> Self {
        Self::with_config(port, TransferConfig::default())
    }

    /// Create a transfer handler with custom configuration.
    pub fn with_config(port: &'a mut P, config: TransferConfig) -> Self {
        Self {
            port,
            encoder: FrameEncoder::new(config.protocol),
            config,
            reader: LineReader::new(),
            stats: TransferStats::default(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Transfer `image`.
    ///
    /// # Arguments
    ///
    /// * `image` - Firmware to send
    /// * `progress` - Callback receiving [`TransferEvent`]s
    pub fn run<F>(&mut self, image: &FirmwareImage, mut progress: F) -> Result<TransferStats>
    where
        F: FnMut(TransferEvent),
    {
        self.config.protocol.validate()?;
        self.stats = TransferStats::default();
        self.reader.clear();
        let started = Instant::now();

        info!(
            "Starting OTA transfer: {} bytes, {} pages",
            image.len(),
            image.page_count(&self.config.protocol)
        );

        let start = self.encoder.encode_command(Command::Start);
        self.send_frame(&start)?;

        if let Err(e) = self.run_session(image, &mut progress) {
            if self.config.abort_on_failure && !matches!(e, Error::Io(_)) {
                self.send_abort();
            }
            return Err(e);
        }

        self.stats.elapsed = started.elapsed();
        info!(
            "OTA transfer complete: {} pages, {} NACKs, {:.1}s",
            self.stats.pages,
            self.stats.nacks,
            self.stats.elapsed.as_secs_f64()
        );
        Ok(self.stats)
    }

    fn run_session(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(TransferEvent),
    ) -> Result<()> {
        self.wait_for("start ACK", |r| matches!(r, Reply::Ack))?;
        progress(TransferEvent::Started);
        sleep(self.config.start_delay);

        let header = self.encoder.encode_header(image.data())?;
        self.send_frame(&header)?;
        self.wait_for("HEADER_OK", |r| matches!(r, Reply::HeaderOk))?;
        info!("Header accepted (CRC 0x{:08X})", image.crc());
        progress(TransferEvent::HeaderAccepted {
            image_size: image.len(),
            image_crc: image.crc(),
        });
        sleep(self.config.header_delay);

        self.send_pages(image, progress)?;

        sleep(self.config.end_delay);
        let end = self.encoder.encode_command(Command::End);
        self.send_frame(&end)?;
        progress(TransferEvent::Finished);
        Ok(())
    }

    fn send_pages(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(TransferEvent),
    ) -> Result<()> {
        let protocol = self.config.protocol;
        let data = image.data();
        let total = data.len();
        let mut state = TransferState::default();

        while state.offset < total {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }

            let page_start = state.page_index * protocol.page_size;
            let page_end = (page_start + protocol.page_size).min(total);
            let page = &data[page_start..page_end];
            let chunk_count = protocol.chunks_in(page.len());

            if state.chunk_index_in_page == 0 {
                debug!(
                    "Page {} ({} bytes, attempt {})",
                    state.page_index,
                    page.len(),
                    state.page_retries + 1
                );
                progress(TransferEvent::PageStarted {
                    page_index: state.page_index,
                    attempt: state.page_retries + 1,
                });
                let bulk = self.encoder.encode_bulk_header(page);
                self.send_frame(&bulk)?;
                self.wait_for_line("bulk header")?;
                sleep(self.config.bulk_delay);
            }

            let chunk_end = (state.offset + protocol.chunk_size).min(page_end);
            let frame = self.encoder.encode_data(&data[state.offset..chunk_end])?;
            self.send_frame(&frame)?;

            // The last chunk's reply is consumed by the commit wait
            if state.chunk_index_in_page + 1 < chunk_count {
                self.wait_for_line("data")?;
            }

            progress(TransferEvent::ChunkSent {
                page_index: state.page_index,
                chunk_index: state.chunk_index_in_page,
                offset: chunk_end,
                total,
            });
            state.offset = chunk_end;
            state.chunk_index_in_page += 1;
            sleep(self.config.chunk_delay);

            if state.chunk_index_in_page < chunk_count {
                continue;
            }

            match self.wait_for("page ACK/NACK", |r| matches!(r, Reply::Ack | Reply::Nack))? {
                Reply::Nack => {
                    state.page_retries += 1;
                    self.stats.nacks += 1;
                    warn!(
                        "Page {} rejected ({} time(s)), resending",
                        state.page_index, state.page_retries
                    );
                    progress(TransferEvent::PageRejected {
                        page_index: state.page_index,
                        rejections: state.page_retries,
                    });
                    if let Some(max) = self.config.max_page_retries {
                        if state.page_retries > max {
                            return Err(Error::TransferFailed {
                                page_index: state.page_index,
                                retries: max,
                            });
                        }
                    }
                    state.offset = page_start;
                    state.chunk_index_in_page = 0;
                },
                _ => {
                    debug!("Page {} committed", state.page_index);
                    progress(TransferEvent::PageCommitted {
                        page_index: state.page_index,
                    });
                    self.stats.pages += 1;
                    state.page_index += 1;
                    state.chunk_index_in_page = 0;
                    state.page_retries = 0;
                },
            }
        }

        Ok(())
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let data = frame.to_bytes();
        trace!(
            "Sending {} frame: {} bytes",
            frame.packet_type(),
            data.len()
        );

        self.port.write_all(&data)?;
        self.port.flush()?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += data.len();
        Ok(())
    }

    fn send_abort(&mut self) {
        warn!("Sending abort command");
        let abort = self.encoder.encode_command(Command::Abort);
        if let Err(e) = self.send_frame(&abort) {
            debug!("Abort not sent: {e}");
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.ack_timeout.map(|t| Instant::now() + t)
    }

    fn read_reply(&mut self, deadline: Option<Instant>, what: &str) -> Result<Reply> {
        let line = self
            .reader
            .read_line(&mut *self.port, deadline)
            .map_err(|e| match e {
                Error::Timeout(_) => Error::Timeout(format!("waiting for {what}")),
                other => other,
            })?;
        Ok(Reply::parse(&line))
    }

    /// Read lines until one satisfies `accept`; other lines are ignored.
    fn wait_for(&mut self, what: &str, accept: impl Fn(&Reply) -> bool) -> Result<Reply> {
        let deadline = self.deadline();
        loop {
            let reply = self.read_reply(deadline, what)?;
            if accept(&reply) {
                return Ok(reply);
            }
            trace!("Ignoring {reply:?} while waiting for {what}");
        }
    }

    /// Wait for any non-empty line; its content is not checked.
    fn wait_for_line(&mut self, what: &str) -> Result<()> {
        let reply = self.wait_for(what, Reply::is_some_line)?;
        trace!("{what} acknowledged with {reply:?}");
        Ok(())
    }
}

fn sleep(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}
