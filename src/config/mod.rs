use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("target address must not be empty")]
    EmptyAddress,

    #[error("requests_per_connection must be at least 1")]
    ZeroQuota,

    #[error("max_frame_size must be at least 1")]
    ZeroFrameSize,

    #[error("progress refresh_ms must be at least 1")]
    ZeroRefresh,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub run: RunConfig,
    pub socket: SocketConfig,
    pub progress: ProgressConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TargetConfig {
    pub addr: String,
    pub port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            port: 10086,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub connections: usize,
    pub requests_per_connection: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            connections: 1,
            requests_per_connection: 1,
        }
    }
}

impl RunConfig {
    /// Exchanges the whole run performs if every response arrives.
    pub fn expected_exchanges(&self) -> u64 {
        (self.connections as u64).saturating_mul(self.requests_per_connection)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SocketConfig {
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub nodelay: bool,
    pub keepalive_secs: u64,
    pub max_frame_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 10240,
            recv_buffer_size: 10240,
            nodelay: true,
            keepalive_secs: 30,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProgressConfig {
    pub refresh_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { refresh_ms: 100 }
    }
}

impl ProgressConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.addr.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.run.requests_per_connection == 0 {
            return Err(ConfigError::ZeroQuota);
        }
        if self.socket.max_frame_size == 0 {
            return Err(ConfigError::ZeroFrameSize);
        }
        if self.progress.refresh_ms == 0 {
            return Err(ConfigError::ZeroRefresh);
        }
        Ok(())
    }
}
