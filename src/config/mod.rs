//! Configuration module
//!
//! Handles loading and saving xapnet configuration, and resolving the
//! connection options into a [`ConnectionConfig`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::ConnectionConfig;
use crate::protocol::{generate_id, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Default address for both receiving and sending
pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Multiplier applied to the heartbeat period while waiting for our own echo
pub const DEFAULT_HEARTBEAT_BACKOFF: f64 = 2.0;

/// xAP protocol generation, selecting the uid style and defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V12,
    #[default]
    V13,
}

/// Vendor, device and instance parts of a source address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAddress {
    #[serde(default = "default_vendor")]
    pub vendor: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_instance")]
    pub instance: String,
}

fn default_vendor() -> String {
    "vendor".to_string()
}

fn default_device() -> String {
    "device".to_string()
}

fn default_instance() -> String {
    "instance".to_string()
}

impl SourceAddress {
    pub fn new(vendor: impl Into<String>, device: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            device: device.into(),
            instance: instance.into(),
        }
    }

    /// Parse `vendor.device.instance`; the instance may itself contain dots
    pub fn parse(source: &str) -> Option<Self> {
        let mut parts = source.splitn(3, '.');
        let vendor = parts.next().filter(|s| !s.is_empty())?;
        let device = parts.next().filter(|s| !s.is_empty())?;
        let instance = parts.next().filter(|s| !s.is_empty())?;
        Some(Self::new(vendor, device, instance))
    }
}

impl Default for SourceAddress {
    fn default() -> Self {
        Self::new(default_vendor(), default_device(), default_instance())
    }
}

impl fmt::Display for SourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.vendor, self.device, self.instance)
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Connection settings
    #[serde(default)]
    pub connection: ConnectionOptions,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Connection options as written by the user; anything unset falls back to
/// the defaults for the chosen protocol version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default)]
    pub version: ProtocolVersion,
    #[serde(default)]
    pub source: SourceAddress,
    /// Heartbeat interval in seconds
    pub hb_interval: Option<u32>,
    /// Heartbeat period multiplier used until our own heartbeat is seen
    pub hb_backoff: Option<f64>,
    /// Device uid; generated from the source when unset
    pub identifier: Option<String>,
    pub rx_address: Option<String>,
    pub tx_address: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub loopback: bool,
}

fn parse_address(field: &str, value: Option<&str>) -> IpAddr {
    match value {
        None => DEFAULT_ADDRESS,
        Some(text) => text.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {} '{}', using {}", field, text, DEFAULT_ADDRESS);
            DEFAULT_ADDRESS
        }),
    }
}

impl ConnectionOptions {
    pub fn new(source: SourceAddress) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    /// Fill in defaults and check the options
    pub fn resolve(&self) -> ConfigResult<ConnectionConfig> {
        let hb_interval = self.hb_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if hb_interval == 0 {
            return Err(ConfigError::Invalid("hb_interval must be at least 1 second".into()));
        }

        let hb_backoff = self.hb_backoff.unwrap_or(DEFAULT_HEARTBEAT_BACKOFF);
        if !hb_backoff.is_finite() || hb_backoff < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "hb_backoff must be at least 1.0, got {}",
                hb_backoff
            )));
        }

        let source = self.source.to_string();
        let uid = match self.identifier.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generate_id(self.version, &source),
        };

        Ok(ConnectionConfig {
            version: self.version,
            source: self.source.clone(),
            hb_interval,
            hb_backoff,
            uid,
            rx_address: parse_address("rx_address", self.rx_address.as_deref()),
            tx_address: parse_address("tx_address", self.tx_address.as_deref()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            loopback: self.loopback,
        })
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("xapnet/config.toml")),
            Some(PathBuf::from("./xapnet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig { verbose: false },
        connection: ConnectionOptions {
            source: SourceAddress::new("acme", "logger", "example"),
            hb_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            rx_address: Some("0.0.0.0".to_string()),
            tx_address: Some("255.255.255.255".to_string()),
            port: Some(DEFAULT_PORT),
            ..Default::default()
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
