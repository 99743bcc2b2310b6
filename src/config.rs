//! Service configuration
//!
//! Loaded from a TOML file. Every section and key is optional; missing
//! values fall back to the defaults below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::command::MAX_NAME_LEN;
use crate::constants::{
    DEFAULT_CONTROL_PORT, DEFAULT_MAX_SESSIONS, DEFAULT_NOTE_PORT, MAX_PACKET_SIZE,
};
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub service: ServiceConfig,
    pub journal: JournalConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

/// UDP ports and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub control_port: u16,
    /// Defaults to control_port + 1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_port: Option<u16>,
    /// Local port for tagged note packets and raw MIDI
    pub note_port: u16,
    /// Listener poll interval in milliseconds
    pub socket_interval_ms: u64,
    pub max_connections: usize,
    pub max_packet_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            data_port: None,
            note_port: DEFAULT_NOTE_PORT,
            socket_interval_ms: 5,
            max_connections: DEFAULT_MAX_SESSIONS,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn data_port(&self) -> u16 {
        self.data_port
            .unwrap_or_else(|| self.control_port.wrapping_add(1))
    }
}

/// Identity announced to peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "rtpmidi-session".to_string(),
        }
    }
}

/// Recovery journal behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Record distributed events into each peer's journal
    pub write: bool,
    /// Acknowledge received RTP-MIDI with receiver feedback
    pub send_feedback: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            write: true,
            send_feedback: true,
        }
    }
}

/// Outbound connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// "host:port" of a peer control port to invite at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,
    /// Seconds between clock sync rounds on established sessions
    pub sync_interval_secs: u64,
    /// Send periodic sync on the control port rather than the data port
    pub use_control_port: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect: None,
            sync_interval_secs: 10,
            use_control_port: true,
        }
    }
}

/// Log filter used when RUST_LOG is not set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Self::from_toml(&text)
    }

    /// Load `path`, or the per-user config file when present, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Per-user config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "rtpmidi", "rtpmidi-session")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let net = &self.network;
        if net.control_port == 0 || net.note_port == 0 {
            return Err(Error::Config("ports must be non-zero".into()));
        }
        let data_port = net.data_port();
        if data_port == 0 || data_port == net.control_port {
            return Err(Error::Config(format!("invalid data port {}", data_port)));
        }
        if net.note_port == net.control_port || net.note_port == data_port {
            return Err(Error::Config(format!(
                "note port {} collides with session ports",
                net.note_port
            )));
        }
        if net.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if net.max_packet_size == 0 || net.max_packet_size > MAX_PACKET_SIZE {
            return Err(Error::Config(format!(
                "max_packet_size must be 1..={}",
                MAX_PACKET_SIZE
            )));
        }
        if self.service.name.is_empty() || self.service.name.len() > MAX_NAME_LEN {
            return Err(Error::Config("service name must be 1..=1455 bytes".into()));
        }
        if self.remote.sync_interval_secs == 0 {
            return Err(Error::Config("sync_interval_secs must be non-zero".into()));
        }
        Ok(())
    }
}
