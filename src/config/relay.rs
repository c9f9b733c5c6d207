//! Relay configuration
//!
//! Loads server settings from an optional TOML file. Command line flags are
//! applied on top by `main`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default listen address
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Default listen port
pub const DEFAULT_PORT: u16 = 8765;
/// Default directory polled for frame artifacts
pub const DEFAULT_FRAMES_DIR: &str = "./frames";
/// Default broadcast pace in frames per second
pub const DEFAULT_FRAME_RATE: u32 = 60;
/// Default bound on a single outbound send, in milliseconds
pub const DEFAULT_FORWARD_TIMEOUT_MS: u64 = 5000;
/// Default per-connection outbound queue depth
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Directory the execution side writes frame artifacts into
    pub frames_dir: PathBuf,
    /// Target broadcast rate (frames per second)
    pub frame_rate: u32,
    /// Upper bound on how long a forward or frame send may wait
    pub forward_timeout_ms: u64,
    /// Outbound message queue depth per connection
    pub outbound_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            frames_dir: PathBuf::from(DEFAULT_FRAMES_DIR),
            frame_rate: DEFAULT_FRAME_RATE,
            forward_timeout_ms: DEFAULT_FORWARD_TIMEOUT_MS,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults if it
    /// does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the broadcast loop and send paths cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_rate == 0 {
            return Err(ConfigError::Invalid(
                "frame_rate must be greater than zero".to_string(),
            ));
        }
        if self.forward_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "forward_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Time budget for one broadcast iteration
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frame_rate.max(1)))
    }

    /// Bound applied to every outbound send
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("relay.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.socket_addr(), "127.0.0.1:8765");
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        fs::write(&path, "port = 9100\nframes_dir = \"/tmp/render\"\n").unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.frames_dir, PathBuf::from("/tmp/render"));
        assert_eq!(config.frame_rate, DEFAULT_FRAME_RATE);
        assert_eq!(config.bind, DEFAULT_BIND);
    }

    #[test]
    fn test_load_rejects_zero_frame_rate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        fs::write(&path, "frame_rate = 0\n").unwrap();

        let result = RelayConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        fs::write(&path, "port = [[[").unwrap();

        let result = RelayConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_frame_interval() {
        let config = RelayConfig::default();
        let interval = config.frame_interval();
        assert!(interval > Duration::from_millis(16));
        assert!(interval < Duration::from_millis(17));

        let slow = RelayConfig {
            frame_rate: 4,
            ..Default::default()
        };
        assert_eq!(slow.frame_interval(), Duration::from_millis(250));
    }
}
