//! Configuration file support for otaflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (OTAFLASH_*)
//! 3. Local config file (./otaflash.toml)
//! 4. Global config file (~/.config/otaflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use otaflash::{ProtocolConfig, TransferConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
const LOCAL_CONFIG: &str = "otaflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Transfer tuning. Unset fields keep the library defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSection {
    /// Page size in bytes.
    pub page_size: Option<usize>,
    /// Data chunk size in bytes.
    pub chunk_size: Option<usize>,
    /// Acknowledgement timeout; 0 waits forever.
    pub ack_timeout_ms: Option<u64>,
    /// Resends allowed per page.
    pub max_page_retries: Option<u32>,
    /// Delay after the start ACK.
    pub start_delay_ms: Option<u64>,
    /// Delay after `HEADER_OK`.
    pub header_delay_ms: Option<u64>,
    /// Delay after each bulk header.
    pub bulk_delay_ms: Option<u64>,
    /// Delay after each data chunk.
    pub chunk_delay_ms: Option<u64>,
    /// Delay before the end command.
    pub end_delay_ms: Option<u64>,
    /// Send an abort command on failure.
    pub abort_on_failure: Option<bool>,
}

impl TransferSection {
    /// Page/chunk geometry with defaults filled in.
    pub fn protocol(&self) -> ProtocolConfig {
        let defaults = ProtocolConfig::default();
        ProtocolConfig {
            page_size: self.page_size.unwrap_or(defaults.page_size),
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
        }
    }

    /// Full transfer configuration with defaults filled in.
    pub fn transfer_config(&self) -> TransferConfig {
        let mut config = TransferConfig {
            protocol: self.protocol(),
            ..TransferConfig::default()
        };
        if let Some(ms) = self.ack_timeout_ms {
            config.ack_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(retries) = self.max_page_retries {
            config.max_page_retries = Some(retries);
        }
        if let Some(ms) = self.start_delay_ms {
            config.start_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.header_delay_ms {
            config.header_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.bulk_delay_ms {
            config.bulk_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.chunk_delay_ms {
            config.chunk_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.end_delay_ms {
            config.end_delay = Duration::from_millis(ms);
        }
        if let Some(abort) = self.abort_on_failure {
            config.abort_on_failure = abort;
        }
        config
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Transfer configuration.
    #[serde(default)]
    pub transfer: TransferSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "otaflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set fields in `other` win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.connection.serial, other.connection.serial);
        take(&mut self.connection.baud, other.connection.baud);

        let (ours, theirs) = (&mut self.transfer, other.transfer);
        take(&mut ours.page_size, theirs.page_size);
        take(&mut ours.chunk_size, theirs.chunk_size);
        take(&mut ours.ack_timeout_ms, theirs.ack_timeout_ms);
        take(&mut ours.max_page_retries, theirs.max_page_retries);
        take(&mut ours.start_delay_ms, theirs.start_delay_ms);
        take(&mut ours.header_delay_ms, theirs.header_delay_ms);
        take(&mut ours.bulk_delay_ms, theirs.bulk_delay_ms);
        take(&mut ours.chunk_delay_ms, theirs.chunk_delay_ms);
        take(&mut ours.end_delay_ms, theirs.end_delay_ms);
        take(&mut ours.abort_on_failure, theirs.abort_on_failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.transfer.page_size.is_none());
        assert!(config.transfer.abort_on_failure.is_none());
    }

    #[test]
    fn test_defaults_match_library() {
        let config = Config::default().transfer.transfer_config();
        let library = TransferConfig::default();

        assert_eq!(config.protocol, library.protocol);
        assert_eq!(config.ack_timeout, library.ack_timeout);
        assert_eq!(config.max_page_retries, library.max_page_retries);
        assert_eq!(config.chunk_delay, library.chunk_delay);
        assert_eq!(config.start_delay, Duration::from_millis(500));
        assert_eq!(config.header_delay, Duration::from_millis(100));
        assert!(config.abort_on_failure);
    }

    #[test]
    fn test_config_merge_serial() {
        let mut base = Config::default();
        let mut other = Config::default();
        other.connection.serial = Some("/dev/ttyUSB0".to_string());
        other.transfer.page_size = Some(1024);

        base.merge(other);

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.transfer.page_size, Some(1024));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.baud = Some(115200);
        base.transfer.max_page_retries = Some(3);

        base.merge(Config::default());

        assert_eq!(base.connection.baud, Some(115200));
        assert_eq!(base.transfer.max_page_retries, Some(3));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
serial = "/dev/ttyACM0"
baud = 115200

[transfer]
page_size = 1024
chunk_size = 128
ack_timeout_ms = 0
max_page_retries = 4
chunk_delay_ms = 0
start_delay_ms = 250
abort_on_failure = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(115200));

        let transfer = config.transfer.transfer_config();
        assert_eq!(transfer.protocol, ProtocolConfig::new(1024, 128).unwrap());
        assert_eq!(transfer.ack_timeout, None);
        assert_eq!(transfer.max_page_retries, Some(4));
        assert_eq!(transfer.chunk_delay, Duration::ZERO);
        assert_eq!(transfer.bulk_delay, Duration::from_millis(100));
        assert_eq!(transfer.start_delay, Duration::from_millis(250));
        assert_eq!(transfer.header_delay, Duration::from_millis(100));
        assert!(!transfer.abort_on_failure);
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.serial.is_none());
        assert_eq!(config.transfer.protocol(), ProtocolConfig::default());
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[connection]\nserial = \"COM7\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.serial.as_deref(), Some("COM7"));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[transfer\npage_size = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.transfer.page_size.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/otaflash.toml"));
        assert!(config.connection.serial.is_none());
    }

    #[test]
    fn test_global_config_path_name() {
        if let Some(path) = Config::global_config_path() {
            assert!(path.ends_with("config.toml"));
        }
    }
}
