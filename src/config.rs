//! Application configuration
//!
//! Loaded from a TOML file; every section and field has a default so an
//! empty file (or no file at all) yields a working client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub buffers: BufferConfig,
    pub clock: ClockConfig,
    pub client: ClientConfig,
    pub rpc: RpcConfig,
}

/// Audio stream connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Empty means the server must be given on the command line
    pub server_ip: String,
    pub stream_port: u16,
    pub rpc_port: u16,
    pub reconnect_on_error: bool,
    pub reconnect_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound on a single blocking socket read
    pub socket_poll_ms: u64,
    pub time_sync_interval_ms: u64,
    /// Time-sync cadence used until the clock estimate is ready
    pub time_sync_fast_interval_ms: u64,
    /// Consecutive malformed messages tolerated before forcing a reconnect
    pub max_framing_errors: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            server_ip: String::new(),
            stream_port: constants::DEFAULT_STREAM_PORT,
            rpc_port: constants::DEFAULT_RPC_PORT,
            reconnect_on_error: true,
            reconnect_backoff_ms: 1000,
            connect_timeout_ms: 2000,
            socket_poll_ms: 100,
            time_sync_interval_ms: 2000,
            time_sync_fast_interval_ms: 100,
            max_framing_errors: 8,
        }
    }
}

impl StreamConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn socket_poll(&self) -> Duration {
        Duration::from_millis(self.socket_poll_ms)
    }
}

/// Ring buffer and queue sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Transport to controller message buffer
    pub stream_buffer_bytes: usize,
    /// Controller to playback sink timed buffer
    pub playout_buffer_bytes: usize,
    pub outgoing_queue_len: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            stream_buffer_bytes: constants::STREAM_BUFFER_BYTES,
            playout_buffer_bytes: constants::PLAYOUT_BUFFER_BYTES,
            outgoing_queue_len: constants::OUTGOING_QUEUE_LEN,
        }
    }
}

/// Clock offset estimator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub smoothing: f32,
    pub outlier_threshold_ms: i64,
    pub min_valid_samples: usize,
    pub max_consecutive_outliers: usize,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.02,
            outlier_threshold_ms: 10,
            min_valid_samples: 20,
            max_consecutive_outliers: 5,
        }
    }
}

/// Identity announced to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    pub host_name: String,
    /// Generated on load when empty
    pub id: String,
    pub instance: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let host_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "snapstream".to_string());
        Self {
            name: host_name.clone(),
            host_name,
            id: String::new(),
            instance: 1,
        }
    }
}

/// Control channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub enabled: bool,
    pub reconnect_backoff_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_backoff_ms: 10_000,
        }
    }
}

impl AppConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.fill_generated();
        config.validate()?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the platform config directory, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        let mut config = Self::default();
        config.fill_generated();
        Ok(config)
    }

    /// `<config dir>/snapstream/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "snapstream")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream.stream_port == 0 {
            return Err(Error::Config("stream_port must be non-zero".into()));
        }
        if self.stream.socket_poll_ms == 0 {
            return Err(Error::Config("socket_poll_ms must be non-zero".into()));
        }
        if self.buffers.outgoing_queue_len == 0 {
            return Err(Error::Config("outgoing_queue_len must be non-zero".into()));
        }
        if self.buffers.stream_buffer_bytes < crate::protocol::MessageHeader::SIZE {
            return Err(Error::Config(format!(
                "stream_buffer_bytes {} cannot hold a message header",
                self.buffers.stream_buffer_bytes
            )));
        }
        if !(0.0..=1.0).contains(&self.clock.smoothing) || self.clock.smoothing == 0.0 {
            return Err(Error::Config(format!(
                "clock smoothing {} must be in (0, 1]",
                self.clock.smoothing
            )));
        }
        if self.clock.min_valid_samples == 0 || self.clock.max_consecutive_outliers == 0 {
            return Err(Error::Config(
                "clock sample counts must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn fill_generated(&mut self) {
        if self.client.id.is_empty() {
            self.client.id = uuid::Uuid::new_v4().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.stream.stream_port, 1704);
        assert_eq!(config.stream.rpc_port, 1705);
        assert!(config.stream.reconnect_on_error);
        assert_eq!(config.buffers.outgoing_queue_len, 10);
        assert_eq!(config.clock.min_valid_samples, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [stream]
            server_ip = "192.168.1.10"
            reconnect_on_error = false

            [clock]
            outlier_threshold_ms = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.stream.server_ip, "192.168.1.10");
        assert!(!config.stream.reconnect_on_error);
        assert_eq!(config.stream.stream_port, 1704);
        assert_eq!(config.clock.outlier_threshold_ms, 25);
        assert_eq!(config.clock.smoothing, 0.02);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.clock.smoothing = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.buffers.outgoing_queue_len = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_generates_id() {
        let path = std::env::temp_dir().join(format!("snapstream-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[client]\nname = \"Den\"\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.client.name, "Den");
        assert!(!config.client.id.is_empty());
    }
}
