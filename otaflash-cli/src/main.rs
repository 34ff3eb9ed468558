//! otaflash CLI - Command-line tool for ETX OTA firmware updates.
//!
//! ## Features
//!
//! - Flash raw firmware images over the ETX OTA UART bootloader protocol
//! - Inspect the page/chunk layout and CRCs of an image
//! - Decode captured host-to-device traffic
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Missing or inconsistent arguments.
    #[error("{0}")]
    Usage(String),
    /// Stopped by the user.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error chain to a process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return cli.exit_code();
    }
    let interrupted = err
        .chain()
        .any(|e| matches!(e.downcast_ref::<otaflash::Error>(), Some(otaflash::Error::Interrupted)));
    if interrupted { 130 } else { 1 }
}

/// otaflash - Firmware updates over the ETX OTA UART bootloader.
///
/// Environment variables:
///   OTAFLASH_PORT   - Default serial port
///   OTAFLASH_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "otaflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port connected to the bootloader.
    #[arg(short, long, global = true, env = "OTAFLASH_PORT")]
    port: Option<String>,

    /// Baud rate (default: 115200).
    #[arg(short, long, global = true, env = "OTAFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Page and chunk geometry overrides.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct GeometryArgs {
    /// Page (bulk) size in bytes.
    #[arg(long, value_name = "BYTES")]
    page_size: Option<usize>,

    /// Data chunk size in bytes.
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<usize>,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a raw firmware image.
    Flash {
        /// Path to the firmware binary.
        firmware: PathBuf,

        #[command(flatten)]
        geometry: GeometryArgs,

        /// Seconds to wait for each device reply (0 waits forever).
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Resends allowed per page before giving up.
        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,

        /// Do not send an abort command when the transfer fails.
        #[arg(long)]
        no_abort: bool,
    },

    /// Show the transfer layout of a firmware image.
    Info {
        /// Path to the firmware binary.
        firmware: PathBuf,

        #[command(flatten)]
        geometry: GeometryArgs,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Decode a captured host-to-device byte stream.
    Decode {
        /// Path to the capture file.
        capture: PathBuf,

        /// Output frames as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code(&err)
        },
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "otaflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Ctrl-C handler not installed: {e}");
    }
    otaflash::set_interrupt_checker(was_interrupted);

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            firmware,
            geometry,
            timeout,
            max_retries,
            no_abort,
        } => {
            let options = commands::flash::FlashOptions {
                geometry: geometry.clone(),
                timeout: *timeout,
                max_retries: *max_retries,
                no_abort: *no_abort,
            };
            commands::flash::cmd_flash(&cli, &config, firmware, &options)?;
        },
        Commands::Info {
            firmware,
            geometry,
            json,
        } => {
            let protocol = geometry.apply(config.transfer.protocol());
            commands::info::cmd_info(firmware, &protocol, *json)?;
        },
        Commands::Decode { capture, json } => {
            commands::decode::cmd_decode(capture, *json)?;
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
        },
    }

    Ok(())
}

impl GeometryArgs {
    /// Override `base` with the sizes given on the command line.
    pub(crate) fn apply(&self, base: otaflash::ProtocolConfig) -> otaflash::ProtocolConfig {
        otaflash::ProtocolConfig {
            page_size: self.page_size.unwrap_or(base.page_size),
            chunk_size: self.chunk_size.unwrap_or(base.chunk_size),
        }
    }
}

/// Resolve the serial port from CLI args, then config.
pub(crate) fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    cli.port
        .clone()
        .or_else(|| config.connection.serial.clone())
        .ok_or_else(|| {
            CliError::Usage(
                "no serial port given; use --port, OTAFLASH_PORT or connection.serial".into(),
            )
            .into()
        })
}

/// Resolve the baud rate from CLI args, then config.
pub(crate) fn get_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.connection.baud)
        .unwrap_or(otaflash::port::DEFAULT_BAUD)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "otaflash",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "57600",
            "flash",
            "app.bin",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(57600));
        assert!(matches!(cli.command, Commands::Flash { .. }));
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "otaflash",
            "flash",
            "app.bin",
            "--page-size",
            "1024",
            "--chunk-size",
            "128",
            "--timeout",
            "0",
            "--max-retries",
            "3",
            "--no-abort",
        ])
        .unwrap();
        if let Commands::Flash {
            firmware,
            geometry,
            timeout,
            max_retries,
            no_abort,
        } = cli.command
        {
            assert_eq!(firmware.to_str().unwrap(), "app.bin");
            assert_eq!(geometry.page_size, Some(1024));
            assert_eq!(geometry.chunk_size, Some(128));
            assert_eq!(timeout, Some(0));
            assert_eq!(max_retries, Some(3));
            assert!(no_abort);
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_parse_info_json() {
        let cli = Cli::try_parse_from(["otaflash", "info", "--json", "app.bin"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true, .. }));
    }

    #[test]
    fn test_cli_parse_decode() {
        let cli = Cli::try_parse_from(["otaflash", "decode", "capture.bin"]).unwrap();
        assert!(matches!(cli.command, Commands::Decode { json: false, .. }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["otaflash", "completions", "bash"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Bash }
        ));
    }

    #[test]
    fn test_cli_default_values() {
        let cli = Cli::try_parse_from(["otaflash", "completions", "zsh"]).unwrap();
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
        assert!(cli.config_path.is_none());
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["otaflash"]).is_err());
    }

    #[test]
    fn test_geometry_override() {
        let args = GeometryArgs {
            page_size: Some(512),
            chunk_size: None,
        };
        let protocol = args.apply(otaflash::ProtocolConfig::default());
        assert_eq!(protocol.page_size, 512);
        assert_eq!(protocol.chunk_size, 256);
    }

    #[test]
    fn test_port_resolution() {
        let cli = Cli::try_parse_from(["otaflash", "--port", "COM3", "flash", "a.bin"]).unwrap();
        let mut config = Config::default();
        config.connection.serial = Some("COM9".into());
        assert_eq!(get_port(&cli, &config).unwrap(), "COM3");

        let cli = Cli::try_parse_from(["otaflash", "flash", "a.bin"]).unwrap();
        if cli.port.is_none() {
            assert_eq!(get_port(&cli, &config).unwrap(), "COM9");
            assert!(get_port(&cli, &Config::default()).is_err());
        }
    }

    #[test]
    fn test_exit_codes() {
        let usage: anyhow::Error = CliError::Usage("x".into()).into();
        let cancelled: anyhow::Error = CliError::Cancelled("x".into()).into();
        let interrupted = anyhow::Error::from(otaflash::Error::Interrupted).context("flashing");
        let other = anyhow::anyhow!("boom");

        assert_eq!(exit_code(&usage), 2);
        assert_eq!(exit_code(&cancelled), 130);
        assert_eq!(exit_code(&interrupted), 130);
        assert_eq!(exit_code(&other), 1);
    }
}
