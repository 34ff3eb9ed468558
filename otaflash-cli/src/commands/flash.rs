//! Flash command implementation.

use anyhow::{Context, Result};
use log::debug;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use otaflash::port::{NativePort, Port, SerialConfig};
use otaflash::{FirmwareImage, OtaTransfer, TransferConfig, TransferEvent, TransferStats};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, GeometryArgs, get_baud, get_port, use_fancy_output, was_interrupted};

/// Flash options given on the command line.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlashOptions {
    pub(crate) geometry: GeometryArgs,
    pub(crate) timeout: Option<u64>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) no_abort: bool,
}

impl FlashOptions {
    /// Layer the command-line overrides on top of `base`.
    fn apply(&self, mut base: TransferConfig) -> TransferConfig {
        base.protocol = self.geometry.apply(base.protocol);
        if let Some(secs) = self.timeout {
            base.ack_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(retries) = self.max_retries {
            base.max_page_retries = Some(retries);
        }
        if self.no_abort {
            base.abort_on_failure = false;
        }
        base
    }
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".into()).into())
    } else {
        Ok(())
    }
}

/// Format a duration as `hh:mm:ss`.
pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    options: &FlashOptions,
) -> Result<TransferStats> {
    let transfer_config = options.apply(config.transfer.transfer_config());
    transfer_config
        .protocol
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;
    let protocol = transfer_config.protocol;

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware: {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware: {}", firmware.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} {} bytes, CRC 0x{:08X}, {} pages of {} bytes, {} chunks",
            style("ℹ").blue(),
            image.len(),
            image.crc(),
            image.page_count(&protocol),
            protocol.page_size,
            image.chunk_count(&protocol)
        );
    }

    let port_name = get_port(cli, config)?;
    let baud = get_baud(cli, config);
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            port_name,
            baud
        );
    }

    let mut port = NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("Failed to open serial port {port_name}"))?;
    port.clear_buffers()?;
    ensure_not_interrupted()?;

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(image.len() as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    if !cli.quiet {
        eprintln!("{} Waiting for bootloader...", style("⏳").yellow());
    }

    let result = OtaTransfer::with_config(&mut port, transfer_config).run(&image, |event| {
        match event {
            TransferEvent::Started => pb.set_message("handshake"),
            TransferEvent::HeaderAccepted { .. } => pb.set_message("header accepted"),
            TransferEvent::PageStarted {
                page_index,
                attempt,
            } => {
                if attempt > 1 {
                    pb.set_message(format!("page {page_index} (retry {})", attempt - 1));
                } else {
                    pb.set_message(format!("page {page_index}"));
                }
            },
            TransferEvent::ChunkSent { offset, .. } => pb.set_position(offset as u64),
            TransferEvent::PageRejected {
                page_index,
                rejections,
            } => pb.println(format!(
                "{} Page {page_index} rejected ({rejections}), resending",
                style("⚠").yellow()
            )),
            TransferEvent::PageCommitted { .. } => {},
            TransferEvent::Finished => pb.set_message("done"),
        }
    });

    if let Err(e) = port.close() {
        debug!("Closing {} failed: {e}", port.name());
    }

    let stats = match result {
        Ok(stats) => stats,
        Err(otaflash::Error::Interrupted) => {
            pb.abandon();
            return Err(CliError::Cancelled("Interrupted by user".into()).into());
        },
        Err(err) if err.is_timeout() => {
            pb.abandon();
            return Err(err).context(
                "Firmware transfer failed: no reply from the bootloader (is the device in update mode?)",
            );
        },
        Err(err) => {
            pb.abandon();
            return Err(err).context("Firmware transfer failed");
        },
    };

    pb.finish_with_message("complete");

    if !cli.quiet {
        eprintln!(
            "\n{} Flashed {} pages in {} ({} NACK{})",
            style("🎉").green().bold(),
            stats.pages,
            format_elapsed(stats.elapsed),
            stats.nacks,
            if stats.nacks == 1 { "" } else { "s" }
        );
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::ZERO), "00:00:00");
        assert_eq!(format_elapsed(Duration::from_millis(61_900)), "00:01:01");
        assert_eq!(format_elapsed(Duration::from_secs(3600 + 120 + 3)), "01:02:03");
    }

    #[test]
    fn test_options_override_config() {
        let options = FlashOptions {
            geometry: GeometryArgs::default(),
            timeout: Some(0),
            max_retries: Some(1),
            no_abort: true,
        };
        let config = options.apply(TransferConfig::default());

        assert_eq!(config.ack_timeout, None);
        assert_eq!(config.max_page_retries, Some(1));
        assert!(!config.abort_on_failure);
    }

    #[test]
    fn test_options_keep_config_when_unset() {
        let base = TransferConfig {
            ack_timeout: Some(Duration::from_secs(5)),
            ..TransferConfig::default()
        };
        let config = FlashOptions::default().apply(base);

        assert_eq!(config.ack_timeout, Some(Duration::from_secs(5)));
        assert!(config.abort_on_failure);
    }
}
